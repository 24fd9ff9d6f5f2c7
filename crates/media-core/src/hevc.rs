//! Raw H.265 bitstream handling, mirroring the H.264 path over the
//! {VPS, SPS, PPS} triple and the HEVCDecoderConfigurationRecord.

use bytes::{BufMut, Bytes, BytesMut};

use crate::annexb;
use crate::error::{Error, Result};

const HEVC_CODEC_ID: u8 = 12;

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;

/// Stateless H.265 helpers, one instance per muxer.
pub struct RawHevcStream;

impl RawHevcStream {
    pub fn new() -> Self {
        Self
    }

    pub fn annexb_demux(&self, stream: &mut Bytes) -> Result<Bytes> {
        annexb::demux(stream)
    }

    fn nal_type(frame: &[u8]) -> u8 {
        if frame.is_empty() {
            return 0xff;
        }
        (frame[0] >> 1) & 0x3f
    }

    pub fn is_vps(&self, frame: &[u8]) -> bool {
        Self::nal_type(frame) == NAL_VPS
    }

    pub fn is_sps(&self, frame: &[u8]) -> bool {
        Self::nal_type(frame) == NAL_SPS
    }

    pub fn is_pps(&self, frame: &[u8]) -> bool {
        Self::nal_type(frame) == NAL_PPS
    }

    /// IRAP pictures (BLA/IDR/CRA), nal types 16..=21.
    pub fn is_keyframe(&self, frame: &[u8]) -> bool {
        (16..=21).contains(&Self::nal_type(frame))
    }

    /// Build an HEVCDecoderConfigurationRecord from the parameter set triple.
    ///
    /// The profile/tier/level block is copied from the SPS
    /// profile_tier_level bytes; the segmentation/parallelism hints are left
    /// at "unknown" as encoders for surveillance gear rarely set them.
    pub fn mux_sequence_header(&self, vps: &[u8], sps: &[u8], pps: &[u8]) -> Result<Bytes> {
        if vps.is_empty() || pps.is_empty() {
            return Err(Error::NalTooShort(0));
        }
        if sps.len() < 15 {
            return Err(Error::NalTooShort(sps.len()));
        }

        let mut sh = BytesMut::with_capacity(23 + 5 * 3 + vps.len() + sps.len() + pps.len());
        sh.put_u8(0x01); // configurationVersion
        sh.put_u8(sps[3]); // profile_space/tier_flag/profile_idc
        sh.put_slice(&sps[4..8]); // general_profile_compatibility_flags
        sh.put_slice(&sps[8..14]); // general_constraint_indicator_flags
        sh.put_u8(sps[14]); // general_level_idc
        sh.put_u16(0xf000); // min_spatial_segmentation_idc: unknown
        sh.put_u8(0xfc); // parallelismType: unknown
        sh.put_u8(0xfd); // chromaFormat: 4:2:0
        sh.put_u8(0xf8); // bitDepthLumaMinus8: 0
        sh.put_u8(0xf8); // bitDepthChromaMinus8: 0
        sh.put_u16(0); // avgFrameRate: unspecified
        // constantFrameRate 0, numTemporalLayers 1, temporalIdNested 0,
        // lengthSizeMinusOne 3.
        sh.put_u8((1 << 3) | 0x03);
        sh.put_u8(3); // numOfArrays

        for (nal_type, data) in [(NAL_VPS, vps), (NAL_SPS, sps), (NAL_PPS, pps)] {
            sh.put_u8(0x80 | nal_type); // array_completeness set
            sh.put_u16(1); // numNalus
            sh.put_u16(data.len() as u16);
            sh.put_slice(data);
        }
        Ok(sh.freeze())
    }

    /// One NAL unit in length-prefixed form, as for H.264.
    pub fn mux_ipb_frame(&self, frame: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + frame.len());
        out.put_u32(frame.len() as u32);
        out.put_slice(frame);
        out.freeze()
    }

    /// Wrap length-prefixed video bytes into an RTMP video tag payload.
    pub fn mux_hevc2flv(
        &self,
        video: &[u8],
        frame_type: u8,
        packet_type: u8,
        dts: u32,
        pts: u32,
    ) -> Bytes {
        let cts = pts.wrapping_sub(dts);
        let mut flv = BytesMut::with_capacity(5 + video.len());
        flv.put_u8((frame_type << 4) | HEVC_CODEC_ID);
        flv.put_u8(packet_type);
        flv.put_u8(((cts >> 16) & 0xff) as u8);
        flv.put_u8(((cts >> 8) & 0xff) as u8);
        flv.put_u8((cts & 0xff) as u8);
        flv.put_slice(video);
        flv.freeze()
    }
}
