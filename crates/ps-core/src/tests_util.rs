//! Shared helpers for building synthetic PS streams in tests.

use crate::demux::PsMessageHandler;
use crate::error::Result;
use crate::types::{PsPacket, TsMessage};

#[derive(Default)]
pub(crate) struct CollectHandler {
    pub packs: Vec<PsPacket>,
    pub msgs: Vec<TsMessage>,
    pub recoveries: Vec<u64>,
    pub reserved: usize,
}

impl PsMessageHandler for CollectHandler {
    fn on_pack_header(&mut self, pack: &PsPacket) -> Result<()> {
        self.packs.push(pack.clone());
        Ok(())
    }

    fn on_ts_message(&mut self, msg: TsMessage) -> Result<()> {
        self.msgs.push(msg);
        Ok(())
    }

    fn on_recover_mode(&mut self, recovered: u64) {
        self.recoveries.push(recovered);
    }

    fn on_reserved_bytes(&mut self, count: usize) {
        self.reserved += count;
    }
}

/// A 14-byte MPEG-2 pack header with no stuffing.
pub(crate) fn pack_header(scr_base: u64, mux_rate: u32) -> Vec<u8> {
    let s = scr_base;
    vec![
        0x00,
        0x00,
        0x01,
        0xba,
        0x44 | (((s >> 30) & 0x07) as u8) << 3 | ((s >> 28) & 0x03) as u8,
        ((s >> 20) & 0xff) as u8,
        ((((s >> 15) & 0x1f) as u8) << 3) | 0x04 | ((s >> 13) & 0x03) as u8,
        ((s >> 5) & 0xff) as u8,
        (((s & 0x1f) as u8) << 3) | 0x04,
        0x01,
        ((mux_rate >> 14) & 0xff) as u8,
        ((mux_rate >> 6) & 0xff) as u8,
        (((mux_rate & 0x3f) as u8) << 2) | 0x03,
        0xf8,
    ]
}

/// A program stream map declaring `(stream_type, elementary_stream_id)` pairs.
pub(crate) fn psm(entries: &[(u8, u8)]) -> Vec<u8> {
    let mut body = vec![0xe5, 0xff, 0x00, 0x00];
    let es_map_len = entries.len() * 4;
    body.push((es_map_len >> 8) as u8);
    body.push((es_map_len & 0xff) as u8);
    for &(stream_type, es_id) in entries {
        body.extend_from_slice(&[stream_type, es_id, 0x00, 0x00]);
    }
    body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // CRC placeholder

    let mut out = vec![0x00, 0x00, 0x01, 0xbc];
    out.push((body.len() >> 8) as u8);
    out.push((body.len() & 0xff) as u8);
    out.extend_from_slice(&body);
    out
}

fn encode_ts(prefix: u8, v: u64) -> [u8; 5] {
    [
        (prefix << 4) | ((((v >> 30) & 0x07) as u8) << 1) | 0x01,
        ((v >> 22) & 0xff) as u8,
        ((((v >> 15) & 0x7f) as u8) << 1) | 0x01,
        ((v >> 7) & 0xff) as u8,
        (((v & 0x7f) as u8) << 1) | 0x01,
    ]
}

/// A bounded PES packet with PTS (and optional DTS).
pub(crate) fn pes(sid: u8, pts: u64, dts: Option<u64>, payload: &[u8]) -> Vec<u8> {
    let header_data_len: usize = if dts.is_some() { 10 } else { 5 };
    let packet_len = 3 + header_data_len + payload.len();

    let mut out = vec![0x00, 0x00, 0x01, sid];
    out.push((packet_len >> 8) as u8);
    out.push((packet_len & 0xff) as u8);
    out.push(0x80);
    out.push(if dts.is_some() { 0xc0 } else { 0x80 });
    out.push(header_data_len as u8);
    match dts {
        Some(dts) => {
            out.extend_from_slice(&encode_ts(0x03, pts));
            out.extend_from_slice(&encode_ts(0x01, dts));
        }
        None => out.extend_from_slice(&encode_ts(0x02, pts)),
    }
    out.extend_from_slice(payload);
    out
}

/// An unbounded PES packet (PES_packet_length 0), closed by the next start code.
pub(crate) fn pes_unbounded(sid: u8, pts: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, sid, 0x00, 0x00, 0x80, 0x80, 0x05];
    out.extend_from_slice(&encode_ts(0x02, pts));
    out.extend_from_slice(payload);
    out
}
