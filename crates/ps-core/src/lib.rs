//! MPEG Program Stream demultiplexing for GB28181 media.
//!
//! Surveillance devices deliver an MPEG-PS stream inside RTP over TCP. This
//! crate turns those RTP payloads back into elementary-stream messages:
//!
//! - [`PsDemuxer`] parses PS packs, system headers, program stream maps and
//!   PES packets, emitting one [`TsMessage`] per completed PES unit.
//! - [`RecoverablePsDemuxer`] wraps the demuxer with the resynchronisation
//!   behaviour field devices make necessary: on any decode error it drops
//!   bytes until the next pack start code instead of failing the stream.
//! - [`PackContext`] regroups the messages of one PS pack into a bundle, so
//!   a multi-PES video frame and its audio travel upstream together.

pub mod error;
#[cfg(test)]
pub(crate) mod tests_util;
pub mod types;
pub mod demux;
pub mod recover;
pub mod pack;

pub use error::{Error, Result};
pub use types::{PsCodec, PsPacket, TsMessage};
pub use demux::{PsDemuxer, PsMessageHandler};
pub use recover::RecoverablePsDemuxer;
pub use pack::{PackContext, PackStats, PsPackHandler};

/// The 4-byte start code of a PS pack header, the resynchronisation anchor.
pub const PS_PACK_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xba];
