use bytes::BytesMut;

/// Stream id ranges from ISO 13818-1 table 2-18.
pub const SID_PROGRAM_END: u8 = 0xb9;
pub const SID_PACK_HEADER: u8 = 0xba;
pub const SID_SYSTEM_HEADER: u8 = 0xbb;
pub const SID_PROGRAM_STREAM_MAP: u8 = 0xbc;
pub const SID_PRIVATE_STREAM_1: u8 = 0xbd;
pub const SID_PADDING: u8 = 0xbe;
pub const SID_PRIVATE_STREAM_2: u8 = 0xbf;

/// The codec carried by an elementary stream, as declared by the program
/// stream map. GB/T 28181 uses the MPEG stream types for H.264/H.265/AAC/MP3
/// and vendor values for Opus and Speex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsCodec {
    H264,
    H265,
    Aac,
    Mp3,
    Opus,
    Speex,
    Unknown,
}

impl PsCodec {
    /// Map a PSM stream_type to a codec.
    pub fn from_stream_type(stream_type: u8) -> PsCodec {
        match stream_type {
            0x1b => PsCodec::H264,
            0x24 => PsCodec::H265,
            0x0f | 0x11 => PsCodec::Aac,
            0x03 | 0x04 => PsCodec::Mp3,
            0x9c => PsCodec::Opus,
            0x9d => PsCodec::Speex,
            _ => PsCodec::Unknown,
        }
    }
}

/// One PS pack header. It is a bounded record: the PES messages that follow
/// it are delivered separately and refer back to the pack by [`PsPacket::id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsPacket {
    /// Monotonic pack counter within one demuxer, used to group messages.
    pub id: u64,
    /// The 33-bit system clock reference base.
    pub scr_base: u64,
    /// The 9-bit system clock reference extension.
    pub scr_ext: u16,
    /// The 22-bit program mux rate, in units of 50 bytes/second.
    pub program_mux_rate: u32,
}

/// One PES unit: stream id, codec, timestamps and payload.
///
/// A video frame may span several `TsMessage`s inside one pack; the pack
/// context concatenates them and carries timestamps forward.
#[derive(Debug, Clone)]
pub struct TsMessage {
    /// The pack this message belongs to.
    pub pack_id: u64,
    /// PES stream id (`0xe0..=0xef` video, `0xc0..=0xdf` audio).
    pub sid: u8,
    /// Codec declared by the PSM for this stream.
    pub codec: PsCodec,
    /// Presentation timestamp, 90 kHz units. Zero when the PES carried none.
    pub pts: u64,
    /// Decode timestamp, 90 kHz units. Equals `pts` when the PES had no DTS.
    pub dts: u64,
    /// The PES payload bytes.
    pub payload: BytesMut,
}

impl TsMessage {
    pub fn is_video(&self) -> bool {
        (0xe0..=0xef).contains(&self.sid)
    }

    pub fn is_audio(&self) -> bool {
        (0xc0..=0xdf).contains(&self.sid)
    }
}
