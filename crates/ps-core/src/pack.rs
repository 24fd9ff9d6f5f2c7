//! Pack-based regrouping of PES messages.
//!
//! The muxer wants whole frames: one PS pack carries one video frame (often
//! split over several PES packets) plus its audio. [`PackContext`] buffers
//! the messages of the current pack and flushes them upstream as one bundle
//! when the next pack header arrives.
//!
//! Later video PES packets of a split frame arrive with PTS/DTS zero; the
//! context rewrites them from the first timestamped message of the same
//! stream in the pack. Audio PES packets stay below 64 KiB, bounded by the
//! 16-bit PES_packet_length.

use crate::demux::PsMessageHandler;
use crate::error::{Error, Result};
use crate::types::{PsPacket, TsMessage};

/// Receives one completed pack bundle at a time, in pack-arrival order.
pub trait PsPackHandler {
    fn on_ps_pack(&mut self, pack: &PsPacket, msgs: Vec<TsMessage>) -> Result<()>;
}

/// Counters kept per media connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackStats {
    /// Packs seen.
    pub packs: u64,
    /// PES messages seen.
    pub msgs: u64,
    /// Times the decoder entered recover mode.
    pub recovered: u64,
    /// Messages discarded because their pack was corrupt.
    pub msgs_dropped: u64,
    /// RTP header bytes skipped before PS decoding.
    pub reserved: u64,
}

/// Groups the messages of one PS pack and forwards them as a bundle.
pub struct PackContext<H: PsPackHandler> {
    /// Identifies the media connection in logs; a new connection gets a new id.
    pub media_id: u32,
    handler: H,
    current: Option<PsPacket>,
    msgs: Vec<TsMessage>,
    last_video: Option<(u64, u64)>,
    last_audio: Option<(u64, u64)>,
    stats: PackStats,
}

impl<H: PsPackHandler> PackContext<H> {
    pub fn new(media_id: u32, handler: H) -> Self {
        Self {
            media_id,
            handler,
            current: None,
            msgs: Vec::new(),
            last_video: None,
            last_audio: None,
            stats: PackStats::default(),
        }
    }

    pub fn stats(&self) -> PackStats {
        self.stats
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Flush the bundle collected so far, if any. Called on the next pack
    /// header and when the media connection closes.
    pub fn flush(&mut self) -> Result<()> {
        let Some(pack) = self.current.take() else {
            return Ok(());
        };
        self.last_video = None;
        self.last_audio = None;
        let msgs = std::mem::take(&mut self.msgs);
        if msgs.is_empty() {
            return Ok(());
        }
        self.handler
            .on_ps_pack(&pack, msgs)
            .map_err(|e| Error::Handler(e.to_string()))
    }
}

impl<H: PsPackHandler> PsMessageHandler for PackContext<H> {
    fn on_pack_header(&mut self, pack: &PsPacket) -> Result<()> {
        self.flush()?;
        self.stats.packs += 1;
        self.current = Some(pack.clone());
        Ok(())
    }

    fn on_ts_message(&mut self, mut msg: TsMessage) -> Result<()> {
        self.stats.msgs += 1;

        // Timestamp carry for split frames.
        let last = if msg.is_video() {
            &mut self.last_video
        } else {
            &mut self.last_audio
        };
        if msg.pts == 0 && msg.dts == 0 {
            if let Some((pts, dts)) = *last {
                msg.pts = pts;
                msg.dts = dts;
            }
        } else {
            *last = Some((msg.pts, msg.dts));
        }

        if self.current.is_none() {
            // A message before any pack header: the stream joined mid-pack.
            self.stats.msgs_dropped += 1;
            return Ok(());
        }
        self.msgs.push(msg);
        Ok(())
    }

    fn on_recover_mode(&mut self, _recovered: u64) {
        // The bundle under construction belongs to the corrupt pack.
        self.stats.recovered += 1;
        self.stats.msgs_dropped += self.msgs.len() as u64;
        self.msgs.clear();
        self.current = None;
        self.last_video = None;
        self.last_audio = None;
    }

    fn on_reserved_bytes(&mut self, count: usize) {
        self.stats.reserved += count as u64;
    }
}
