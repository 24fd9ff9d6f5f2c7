//! The normal-mode PS pack parser.
//!
//! One [`PsDemuxer`] instance serves one media connection. It is fed the PS
//! bytes of successive RTP payloads and emits a [`TsMessage`] for every
//! completed PES packet. A PES payload larger than one RTP payload is carried
//! as a pending message across calls; an unbounded video PES (PES length 0)
//! is closed by the next PS-level start code.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::*;

/// Receives the demuxer's output, one callback per parsed structure.
pub trait PsMessageHandler {
    /// A new pack header was parsed. Returning an error aborts decoding.
    fn on_pack_header(&mut self, pack: &PsPacket) -> Result<()>;

    /// A PES packet completed.
    fn on_ts_message(&mut self, msg: TsMessage) -> Result<()>;

    /// The recoverable wrapper entered recover mode; `recovered` is the
    /// total number of recoveries on this stream so far.
    fn on_recover_mode(&mut self, recovered: u64);

    /// Bytes skipped before decoding (the RTP header prefix).
    fn on_reserved_bytes(&mut self, _count: usize) {}
}

/// A PES packet whose payload has not fully arrived yet.
struct PendingPes {
    msg: TsMessage,
    /// Remaining payload bytes; `None` for an unbounded video PES, which
    /// runs to the next PS-level start code.
    left: Option<usize>,
    /// Structure we only need to skip (padding, system header).
    discard: bool,
}

/// Parser state for one PS stream.
pub struct PsDemuxer {
    next_pack_id: u64,
    current_pack_id: u64,
    pending: Option<PendingPes>,
    video_codec: PsCodec,
    audio_codec: PsCodec,
}

impl PsDemuxer {
    pub fn new() -> Self {
        Self {
            next_pack_id: 0,
            current_pack_id: 0,
            pending: None,
            // GB devices commonly omit the PSM from all but the first pack,
            // so start from the profile's dominant codecs.
            video_codec: PsCodec::H264,
            audio_codec: PsCodec::Aac,
        }
    }

    /// Drop any partially assembled message. Called when the recoverable
    /// wrapper resynchronises: pending bytes are part of the corrupt pack.
    pub fn reset_pending(&mut self) {
        self.pending = None;
    }

    /// Decode every structure in `stream`. Returns `Ok` when the stream is
    /// exhausted, which may leave a pending PES for the next call.
    pub fn decode(&mut self, stream: &mut Bytes, handler: &mut dyn PsMessageHandler) -> Result<()> {
        loop {
            self.feed_pending(stream, handler)?;
            if !stream.has_remaining() {
                return Ok(());
            }

            let left = stream.remaining();
            if left < 4 {
                return Err(Error::NeedMoreBytes { needed: 4, left });
            }

            let b = stream.chunk();
            if b[0] != 0x00 || b[1] != 0x00 || b[2] != 0x01 {
                let code = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
                return Err(Error::BadStartCode { code });
            }

            let sid = b[3];
            match sid {
                SID_PACK_HEADER => self.decode_pack_header(stream, handler)?,
                SID_SYSTEM_HEADER | SID_PADDING | SID_PRIVATE_STREAM_2 => {
                    self.decode_skipped(stream, sid)?
                }
                SID_PROGRAM_STREAM_MAP => self.decode_psm(stream)?,
                SID_PROGRAM_END => stream.advance(4),
                _ if is_pes_sid(sid) => self.decode_pes(stream, sid)?,
                _ => return Err(Error::UnknownStreamId { sid }),
            }
        }
    }

    /// Move payload bytes into the pending message, emitting it once done.
    fn feed_pending(&mut self, stream: &mut Bytes, handler: &mut dyn PsMessageHandler) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };

        match pending.left {
            Some(left) => {
                let take = left.min(stream.remaining());
                if take > 0 {
                    let chunk = stream.copy_to_bytes(take);
                    if !pending.discard {
                        pending.msg.payload.extend_from_slice(&chunk);
                    }
                }
                if take == left {
                    let done = self.pending.take().unwrap();
                    self.emit(done, handler)?;
                } else {
                    pending.left = Some(left - take);
                }
            }
            None => {
                // Unbounded video PES: closed by the next PS-level start
                // code. Interior `00 00 01` NAL prefixes must not split it,
                // so only stream ids `>= 0xb9` terminate the payload.
                match find_ps_start_code(stream.chunk()) {
                    Some(at) => {
                        let chunk = stream.copy_to_bytes(at);
                        pending.msg.payload.extend_from_slice(&chunk);
                        let done = self.pending.take().unwrap();
                        self.emit(done, handler)?;
                    }
                    None => {
                        let all = stream.remaining();
                        let chunk = stream.copy_to_bytes(all);
                        pending.msg.payload.extend_from_slice(&chunk);
                    }
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, done: PendingPes, handler: &mut dyn PsMessageHandler) -> Result<()> {
        if done.discard || done.msg.payload.is_empty() {
            return Ok(());
        }
        handler.on_ts_message(done.msg)
    }

    fn decode_pack_header(&mut self, stream: &mut Bytes, handler: &mut dyn PsMessageHandler) -> Result<()> {
        let left = stream.remaining();
        if left < 14 {
            return Err(Error::NeedMoreBytes { needed: 14, left });
        }

        let b = stream.chunk();
        // MPEG-2 pack: '01' prefix and the first marker bit.
        if (b[4] & 0xc0) != 0x40 || (b[4] & 0x04) != 0x04 {
            return Err(Error::BadPackHeader);
        }

        let scr_base = ((b[4] as u64 >> 3) & 0x07) << 30
            | (b[4] as u64 & 0x03) << 28
            | (b[5] as u64) << 20
            | ((b[6] as u64 >> 3) & 0x1f) << 15
            | (b[6] as u64 & 0x03) << 13
            | (b[7] as u64) << 5
            | (b[8] as u64 >> 3) & 0x1f;
        let scr_ext = ((b[8] as u16 & 0x03) << 7) | ((b[9] as u16 >> 1) & 0x7f);
        let program_mux_rate =
            ((b[10] as u32) << 14) | ((b[11] as u32) << 6) | ((b[12] as u32) >> 2);
        let stuffing = (b[13] & 0x07) as usize;

        if left < 14 + stuffing {
            return Err(Error::NeedMoreBytes { needed: 14 + stuffing, left });
        }
        stream.advance(14 + stuffing);

        let pack = PsPacket {
            id: self.next_pack_id,
            scr_base,
            scr_ext,
            program_mux_rate,
        };
        self.next_pack_id += 1;
        self.current_pack_id = pack.id;
        handler.on_pack_header(&pack)
    }

    /// System header, padding and private-stream-2: length-prefixed blobs we
    /// only skip, possibly across several payloads.
    fn decode_skipped(&mut self, stream: &mut Bytes, sid: u8) -> Result<()> {
        let left = stream.remaining();
        if left < 6 {
            return Err(Error::NeedMoreBytes { needed: 6, left });
        }
        let b = stream.chunk();
        let len = u16::from_be_bytes([b[4], b[5]]) as usize;
        stream.advance(6);
        self.pending = Some(PendingPes {
            msg: self.new_message(sid, 0, 0, 0),
            left: Some(len),
            discard: true,
        });
        Ok(())
    }

    fn decode_psm(&mut self, stream: &mut Bytes) -> Result<()> {
        let left = stream.remaining();
        if left < 6 {
            return Err(Error::NeedMoreBytes { needed: 6, left });
        }
        let b = stream.chunk();
        let len = u16::from_be_bytes([b[4], b[5]]) as usize;
        if left < 6 + len {
            return Err(Error::NeedMoreBytes { needed: 6 + len, left });
        }
        let body = &b[6..6 + len];

        // flags(2) + ps_info_len(2) + es_map_len(2) + CRC(4) at minimum.
        if len < 10 {
            return Err(Error::BadPesHeader { sid: SID_PROGRAM_STREAM_MAP });
        }
        let ps_info_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let mut at = 4 + ps_info_len;
        if at + 2 > len {
            return Err(Error::BadPesHeader { sid: SID_PROGRAM_STREAM_MAP });
        }
        let es_map_len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
        at += 2;
        let es_map_end = at + es_map_len;
        if es_map_end > len {
            return Err(Error::BadPesHeader { sid: SID_PROGRAM_STREAM_MAP });
        }

        while at + 4 <= es_map_end {
            let stream_type = body[at];
            let es_id = body[at + 1];
            let es_info_len = u16::from_be_bytes([body[at + 2], body[at + 3]]) as usize;
            at += 4 + es_info_len;
            if at > es_map_end {
                return Err(Error::BadPesHeader { sid: SID_PROGRAM_STREAM_MAP });
            }

            let codec = PsCodec::from_stream_type(stream_type);
            if (0xe0..=0xef).contains(&es_id) {
                if codec == PsCodec::Unknown {
                    tracing::warn!(stream_type, es_id, "unknown video stream type in PSM");
                } else {
                    self.video_codec = codec;
                }
            } else if (0xc0..=0xdf).contains(&es_id) {
                if codec == PsCodec::Unknown {
                    tracing::warn!(stream_type, es_id, "unknown audio stream type in PSM");
                } else {
                    self.audio_codec = codec;
                }
            }
        }

        stream.advance(6 + len);
        Ok(())
    }

    fn decode_pes(&mut self, stream: &mut Bytes, sid: u8) -> Result<()> {
        let left = stream.remaining();
        if left < 9 {
            return Err(Error::NeedMoreBytes { needed: 9, left });
        }
        let b = stream.chunk();
        let packet_len = u16::from_be_bytes([b[4], b[5]]) as usize;

        // PES extension: '10' marker, flags, header data length.
        if (b[6] & 0xc0) != 0x80 {
            return Err(Error::BadPesHeader { sid });
        }
        let pts_dts_flags = (b[7] >> 6) & 0x03;
        let header_data_len = b[8] as usize;
        if left < 9 + header_data_len {
            return Err(Error::NeedMoreBytes { needed: 9 + header_data_len, left });
        }
        let header = &b[9..9 + header_data_len];

        let (pts, dts) = match pts_dts_flags {
            0x02 => {
                if header_data_len < 5 {
                    return Err(Error::BadPesHeader { sid });
                }
                let pts = parse_pts(&header[0..5]);
                (pts, pts)
            }
            0x03 => {
                if header_data_len < 10 {
                    return Err(Error::BadPesHeader { sid });
                }
                (parse_pts(&header[0..5]), parse_pts(&header[5..10]))
            }
            _ => (0, 0),
        };

        let payload_len = if packet_len == 0 {
            // Only video may be unbounded.
            if !(0xe0..=0xef).contains(&sid) {
                return Err(Error::BadPesHeader { sid });
            }
            None
        } else {
            if packet_len < 3 + header_data_len {
                return Err(Error::BadPesHeader { sid });
            }
            Some(packet_len - 3 - header_data_len)
        };

        stream.advance(9 + header_data_len);
        self.pending = Some(PendingPes {
            msg: self.new_message(sid, pts, dts, payload_len.unwrap_or(4096)),
            left: payload_len,
            // Private stream 1 carries vendor data we do not forward.
            discard: sid == SID_PRIVATE_STREAM_1,
        });
        Ok(())
    }

    fn new_message(&self, sid: u8, pts: u64, dts: u64, capacity: usize) -> TsMessage {
        let codec = if (0xe0..=0xef).contains(&sid) {
            self.video_codec
        } else {
            self.audio_codec
        };
        TsMessage {
            pack_id: self.current_pack_id,
            sid,
            codec,
            pts,
            dts,
            payload: BytesMut::with_capacity(capacity),
        }
    }
}

fn is_pes_sid(sid: u8) -> bool {
    (0xc0..=0xef).contains(&sid) || sid == SID_PRIVATE_STREAM_1
}

/// Position of the next PS-level start code (`00 00 01` followed by a
/// system or PES stream id), if any.
pub(crate) fn find_ps_start_code(b: &[u8]) -> Option<usize> {
    if b.len() < 4 {
        return None;
    }
    (0..=b.len() - 4)
        .find(|&i| b[i] == 0x00 && b[i + 1] == 0x00 && b[i + 2] == 0x01 && b[i + 3] >= 0xb9)
}

/// 33-bit timestamp from the 5-byte PES encoding.
fn parse_pts(b: &[u8]) -> u64 {
    ((b[0] as u64 >> 1) & 0x07) << 30
        | (b[1] as u64) << 22
        | ((b[2] as u64 >> 1) & 0x7f) << 15
        | (b[3] as u64) << 7
        | (b[4] as u64 >> 1)
}
