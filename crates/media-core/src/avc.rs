//! Raw H.264 bitstream handling: Annex-B demux, NAL classification, and the
//! FLV/RTMP-side packaging (AVCDecoderConfigurationRecord, length-prefixed
//! NALUs, video tag headers).

use bytes::{BufMut, Bytes, BytesMut};

use crate::annexb;
use crate::error::{Error, Result};

/// FLV video frame types.
pub const FRAME_TYPE_KEY: u8 = 1;
pub const FRAME_TYPE_INTER: u8 = 2;

/// FLV AVC packet types.
pub const AVC_PACKET_SEQUENCE_HEADER: u8 = 0;
pub const AVC_PACKET_NALU: u8 = 1;

const AVC_CODEC_ID: u8 = 7;

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;

/// Stateless H.264 helpers, one instance per muxer.
pub struct RawH264Stream;

impl RawH264Stream {
    pub fn new() -> Self {
        Self
    }

    /// Pop the next NAL unit off an Annex-B stream. See [`annexb::demux`].
    pub fn annexb_demux(&self, stream: &mut Bytes) -> Result<Bytes> {
        annexb::demux(stream)
    }

    pub fn is_sps(&self, frame: &[u8]) -> bool {
        !frame.is_empty() && frame[0] & 0x1f == NAL_SPS
    }

    pub fn is_pps(&self, frame: &[u8]) -> bool {
        !frame.is_empty() && frame[0] & 0x1f == NAL_PPS
    }

    pub fn is_idr(&self, frame: &[u8]) -> bool {
        !frame.is_empty() && frame[0] & 0x1f == NAL_IDR
    }

    pub fn is_aud(&self, frame: &[u8]) -> bool {
        !frame.is_empty() && frame[0] & 0x1f == NAL_AUD
    }

    /// The SPS is carried verbatim; an absent one is legal (not yet seen).
    pub fn sps_demux(&self, frame: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(frame))
    }

    /// The PPS is carried verbatim and must not be empty.
    pub fn pps_demux(&self, frame: &[u8]) -> Result<Bytes> {
        if frame.is_empty() {
            return Err(Error::NalTooShort(0));
        }
        Ok(Bytes::copy_from_slice(frame))
    }

    /// Build the AVCDecoderConfigurationRecord for one SPS/PPS pair.
    pub fn mux_sequence_header(&self, sps: &[u8], pps: &[u8]) -> Result<Bytes> {
        if sps.len() < 4 {
            return Err(Error::NalTooShort(sps.len()));
        }
        if pps.is_empty() {
            return Err(Error::NalTooShort(0));
        }

        let mut sh = BytesMut::with_capacity(11 + sps.len() + pps.len());
        sh.put_u8(0x01); // configurationVersion
        sh.put_u8(sps[1]); // AVCProfileIndication
        sh.put_u8(sps[2]); // profile_compatibility
        sh.put_u8(sps[3]); // AVCLevelIndication
        sh.put_u8(0xff); // 6 bits reserved + lengthSizeMinusOne = 3
        sh.put_u8(0xe1); // 3 bits reserved + numOfSequenceParameterSets = 1
        sh.put_u16(sps.len() as u16);
        sh.put_slice(sps);
        sh.put_u8(0x01); // numOfPictureParameterSets
        sh.put_u16(pps.len() as u16);
        sh.put_slice(pps);
        Ok(sh.freeze())
    }

    /// One NAL unit in AVCC form: 4-byte big-endian length then the bytes.
    pub fn mux_ipb_frame(&self, frame: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + frame.len());
        out.put_u32(frame.len() as u32);
        out.put_slice(frame);
        out.freeze()
    }

    /// Wrap AVCC video bytes into an RTMP video tag payload.
    pub fn mux_avc2flv(
        &self,
        video: &[u8],
        frame_type: u8,
        avc_packet_type: u8,
        dts: u32,
        pts: u32,
    ) -> Bytes {
        let cts = pts.wrapping_sub(dts);
        let mut flv = BytesMut::with_capacity(5 + video.len());
        flv.put_u8((frame_type << 4) | AVC_CODEC_ID);
        flv.put_u8(avc_packet_type);
        flv.put_u8(((cts >> 16) & 0xff) as u8);
        flv.put_u8(((cts >> 8) & 0xff) as u8);
        flv.put_u8((cts & 0xff) as u8);
        flv.put_slice(video);
        flv.freeze()
    }
}
