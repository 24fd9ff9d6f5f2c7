//! Elementary-stream assembly and RTMP publication.
//!
//! The session hands this crate [`gblink_ps_core::TsMessage`]s in
//! pack-arrival order; [`GbMuxer`] turns them into a live RTMP stream:
//!
//! - H.264 (and optionally H.265) Annex-B payloads are split into NAL units,
//!   SPS/PPS changes are tracked, and a sequence header is (re)emitted ahead
//!   of the next keyframe whenever the parameter sets change or the RTMP
//!   connection restarts.
//! - AAC is de-ADTS'd; the AudioSpecificConfig is sent once per connection,
//!   then raw frames follow. MP3/Opus/Speex pass through as plain FLV audio
//!   tags.
//! - Because an AAC PES can carry several logical frames, outgoing frames
//!   pass through a DTS-ordered queue that only releases a frame once both
//!   an audio and a video frame are buffered.
//!
//! The RTMP wire protocol itself comes from the `rml_rtmp` crate;
//! [`rtmp::RtmpClient`] is the thin connect/publish wrapper the muxer uses.

pub mod error;
pub mod annexb;
pub mod avc;
#[cfg(feature = "h265")]
pub mod hevc;
pub mod aac;
pub mod queue;
pub mod rtmp;
pub mod muxer;

pub use error::{Error, Result};
pub use aac::{AacObjectType, AudioCodec, RawAacStream, RawAacStreamCodec};
pub use avc::RawH264Stream;
#[cfg(feature = "h265")]
pub use hevc::RawHevcStream;
pub use muxer::GbMuxer;
pub use queue::{FrameKind, MediaFrame, MpegpsQueue};
pub use rtmp::{RtmpClient, RtmpUrl};
