//! Raw AAC handling: ADTS demux, AudioSpecificConfig, and the FLV audio tag
//! packaging shared with the passthrough codecs (MP3, Opus, Speex).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// FLV `SoundFormat` codes for the audio codecs GB streams carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Mp3 = 2,
    Aac = 10,
    Speex = 11,
    Opus = 13,
}

/// AAC object types, as stored in AudioSpecificConfig (ADTS profile + 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacObjectType {
    Reserved = 0,
    Main = 1,
    Lc = 2,
    Ssr = 3,
}

impl AacObjectType {
    /// From the 2-bit ADTS `profile` field.
    pub fn from_adts_profile(profile: u8) -> AacObjectType {
        match profile {
            0 => AacObjectType::Main,
            1 => AacObjectType::Lc,
            2 => AacObjectType::Ssr,
            _ => AacObjectType::Reserved,
        }
    }
}

/// AAC sampling frequencies by ADTS index.
const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// FLV sound rates, the 2-bit field of the audio tag header.
pub const SOUND_RATE_5512: u8 = 0;
pub const SOUND_RATE_11025: u8 = 1;
pub const SOUND_RATE_22050: u8 = 2;
pub const SOUND_RATE_44100: u8 = 3;

/// FLV AAC packet types.
pub const AAC_PACKET_SEQUENCE_HEADER: u8 = 0;
pub const AAC_PACKET_RAW: u8 = 1;

/// Codec parameters extracted from ADTS (or assumed for passthrough audio),
/// feeding both the AudioSpecificConfig and the FLV tag header bits.
#[derive(Debug, Clone)]
pub struct RawAacStreamCodec {
    pub protection_absent: u8,
    pub object: AacObjectType,
    /// ADTS sampling frequency index; `None` when unknown.
    pub sampling_frequency_index: Option<u8>,
    pub channel_configuration: u8,
    pub frame_length: u16,
    pub sound_format: AudioCodec,
    /// FLV 2-bit sound rate; `None` when unknown/reserved.
    pub sound_rate: Option<u8>,
    pub sound_size: u8,
    pub sound_type: u8,
    pub aac_packet_type: u8,
}

impl Default for RawAacStreamCodec {
    fn default() -> Self {
        Self {
            protection_absent: 0,
            object: AacObjectType::Reserved,
            sampling_frequency_index: None,
            channel_configuration: 0,
            frame_length: 0,
            sound_format: AudioCodec::Aac,
            sound_rate: None,
            sound_size: 1,
            sound_type: 0,
            aac_packet_type: 0,
        }
    }
}

/// Stateless AAC helpers, one instance per muxer.
pub struct RawAacStream;

impl RawAacStream {
    pub fn new() -> Self {
        Self
    }

    /// Pop one ADTS frame off `stream`, filling `codec` from the header and
    /// returning the raw AAC bytes (possibly empty).
    ///
    /// All validation happens before any byte is consumed, so a failed call
    /// leaves the stream untouched.
    pub fn adts_demux(&self, stream: &mut Bytes, codec: &mut RawAacStreamCodec) -> Result<Bytes> {
        let b = stream.chunk();
        if b.len() < 7 {
            return Err(Error::AdtsTooShort(b.len()));
        }

        // Syncword, then layer must be zero for AAC. The MPEG version bit
        // differs between encoders and is ignored.
        if b[0] != 0xff || (b[1] & 0xf0) != 0xf0 || (b[1] >> 1) & 0x03 != 0 {
            return Err(Error::AdtsSync);
        }

        let protection_absent = b[1] & 0x01;
        let profile = (b[2] >> 6) & 0x03;
        let frequency_index = (b[2] >> 2) & 0x0f;
        let channel = ((b[2] & 0x01) << 2) | ((b[3] >> 6) & 0x03);
        let frame_length =
            (((b[3] & 0x03) as u16) << 11) | ((b[4] as u16) << 3) | (((b[5] >> 5) & 0x07) as u16);

        // A protected frame carries a 2-byte CRC after the fixed header.
        let header_len: usize = if protection_absent == 1 { 7 } else { 9 };
        if (frame_length as usize) < header_len {
            return Err(Error::AdtsTruncated { needed: header_len, have: frame_length as usize });
        }
        if stream.remaining() < frame_length as usize {
            return Err(Error::AdtsTruncated {
                needed: frame_length as usize,
                have: stream.remaining(),
            });
        }

        codec.protection_absent = protection_absent;
        codec.object = AacObjectType::from_adts_profile(profile);
        codec.sampling_frequency_index = Some(frequency_index);
        codec.channel_configuration = channel;
        codec.frame_length = frame_length;

        codec.sound_format = AudioCodec::Aac;
        codec.sound_rate = Some(flv_sound_rate(frequency_index));
        codec.sound_size = 1;
        codec.sound_type = if channel > 1 { 1 } else { 0 };

        stream.advance(header_len);
        Ok(stream.copy_to_bytes(frame_length as usize - header_len))
    }

    /// The 2-byte AudioSpecificConfig: 5-bit object type, 4-bit frequency
    /// index, 4-bit channel configuration, 3 trailing zero bits.
    pub fn mux_sequence_header(&self, codec: &RawAacStreamCodec) -> Result<Bytes> {
        if codec.object == AacObjectType::Reserved {
            return Err(Error::AacObject);
        }

        // Fall back to the FLV sound rate when ADTS never told us the index.
        let index = match codec.sampling_frequency_index {
            Some(index) if (index as usize) < AAC_SAMPLE_RATES.len() => index,
            _ => match codec.sound_rate {
                Some(SOUND_RATE_44100) => 4,
                Some(SOUND_RATE_22050) => 7,
                Some(SOUND_RATE_11025) => 10,
                Some(SOUND_RATE_5512) => 11,
                _ => return Err(Error::AacSampleRate),
            },
        };

        let object = codec.object as u8;
        let mut sh = BytesMut::with_capacity(2);
        sh.put_u8((object << 3) | ((index >> 1) & 0x07));
        sh.put_u8(((index & 0x01) << 7) | ((codec.channel_configuration & 0x0f) << 3));
        Ok(sh.freeze())
    }

    /// Wrap one audio frame into an RTMP audio tag payload. AAC gets the
    /// packet-type byte after the tag header; other codecs do not.
    pub fn mux_aac2flv(&self, frame: &[u8], codec: &RawAacStreamCodec, _dts: u32) -> Bytes {
        let rate = codec.sound_rate.unwrap_or(0);
        let header = ((codec.sound_format as u8) << 4)
            | ((rate & 0x03) << 2)
            | ((codec.sound_size & 0x01) << 1)
            | (codec.sound_type & 0x01);

        let mut flv = BytesMut::with_capacity(2 + frame.len());
        flv.put_u8(header);
        if codec.sound_format == AudioCodec::Aac {
            flv.put_u8(codec.aac_packet_type);
        }
        flv.put_slice(frame);
        flv.freeze()
    }
}

/// Best-fit FLV sound rate for an AAC sampling frequency; FLV tops out at
/// 44.1 kHz so anything above reports 44100.
fn flv_sound_rate(frequency_index: u8) -> u8 {
    let hz = AAC_SAMPLE_RATES
        .get(frequency_index as usize)
        .copied()
        .unwrap_or(0);
    if hz >= 44100 {
        SOUND_RATE_44100
    } else if hz >= 22050 {
        SOUND_RATE_22050
    } else if hz >= 11025 {
        SOUND_RATE_11025
    } else {
        SOUND_RATE_5512
    }
}
