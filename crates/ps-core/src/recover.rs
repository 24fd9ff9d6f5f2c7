//! Fault tolerance around the PS parser.
//!
//! Surveillance encoders routinely emit truncated or garbled packs during
//! channel switches. Dropping the whole session would be operationally
//! unacceptable, so on any decode error this wrapper discards bytes until the
//! next `00 00 01 ba` pack start code and resumes parsing there. The caller
//! only ever sees an error if its own handler failed.

use bytes::{Buf, Bytes};

use crate::demux::{PsDemuxer, PsMessageHandler};
use crate::error::Result;
use crate::PS_PACK_START_CODE;

/// A [`PsDemuxer`] that swallows decode errors by resynchronising on the
/// next pack header. Recover mode is sticky across calls until a pack start
/// code is seen.
pub struct RecoverablePsDemuxer {
    demux: PsDemuxer,
    recover: bool,
    nn_recovered: u64,
}

impl RecoverablePsDemuxer {
    pub fn new() -> Self {
        Self {
            demux: PsDemuxer::new(),
            recover: false,
            nn_recovered: 0,
        }
    }

    /// Whether the decoder is currently discarding bytes.
    pub fn in_recover_mode(&self) -> bool {
        self.recover
    }

    /// Decode one RTP payload. `reserved` bytes (the RTP header, already
    /// interpreted by the caller) are skipped first and reported through
    /// [`PsMessageHandler::on_reserved_bytes`].
    ///
    /// All bytes of `stream` are consumed on return; corrupted packs are
    /// reported through the recover counter, never as an error.
    pub fn decode_rtp(
        &mut self,
        stream: &mut Bytes,
        reserved: usize,
        handler: &mut dyn PsMessageHandler,
    ) -> Result<()> {
        if reserved > 0 {
            let n = reserved.min(stream.remaining());
            stream.advance(n);
            handler.on_reserved_bytes(n);
        }
        self.decode(stream, handler)
    }

    fn decode(&mut self, stream: &mut Bytes, handler: &mut dyn PsMessageHandler) -> Result<()> {
        loop {
            if self.recover {
                if !skip_until_pack(stream) {
                    // Stream exhausted while still out of sync.
                    return Ok(());
                }
                self.quit_recover_mode();
            }

            match self.demux.decode(stream, handler) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_decode() => self.enter_recover_mode(stream, handler, &e),
                Err(e) => return Err(e),
            }
        }
    }

    fn enter_recover_mode(
        &mut self,
        stream: &mut Bytes,
        handler: &mut dyn PsMessageHandler,
        cause: &crate::Error,
    ) {
        // Step past the offending byte so a truncated pack header cannot
        // re-match at the same cursor forever.
        if stream.has_remaining() {
            stream.advance(1);
        }
        self.recover = true;
        self.nn_recovered += 1;
        self.demux.reset_pending();
        tracing::debug!(recovered = self.nn_recovered, %cause, "ps decode error, enter recover mode");
        handler.on_recover_mode(self.nn_recovered);
    }

    fn quit_recover_mode(&mut self) {
        tracing::debug!(recovered = self.nn_recovered, "pack header found, quit recover mode");
        self.recover = false;
    }
}

/// Advance `stream` to the next pack start code. Returns false, with the
/// stream fully consumed, when no start code remains.
pub fn skip_until_pack(stream: &mut Bytes) -> bool {
    let b = stream.chunk();
    if b.len() >= 4 {
        for i in 0..=b.len() - 4 {
            if b[i..i + 4] == PS_PACK_START_CODE {
                stream.advance(i);
                return true;
            }
        }
    }
    let all = stream.remaining();
    stream.advance(all);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tests_util::*;
    use crate::types::PsPacket;
    use crate::TsMessage;

    #[test]
    fn skip_until_pack_finds_start_code() {
        let mut b = Bytes::from_static(&[0x01, 0x02, 0x00, 0x00, 0x01, 0xba, 0x44]);
        assert!(skip_until_pack(&mut b));
        assert_eq!(b.remaining(), 5);

        let mut b = Bytes::from_static(&[0x00, 0x00, 0x01, 0xbb]);
        assert!(!skip_until_pack(&mut b));
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn garbage_then_pack_recovers_in_one_call() {
        let mut buf = vec![0xde, 0xad, 0xbe, 0xef, 0x55];
        buf.extend_from_slice(&pack_header(77, 0));
        buf.extend_from_slice(&pes(0xe0, 100, None, &[1, 2, 3]));

        let mut demux = RecoverablePsDemuxer::new();
        let mut h = CollectHandler::default();
        let mut stream = Bytes::from(buf);
        demux.decode_rtp(&mut stream, 0, &mut h).unwrap();

        assert_eq!(stream.remaining(), 0);
        assert!(!demux.in_recover_mode());
        assert_eq!(h.recoveries, vec![1]);
        assert_eq!(h.packs.len(), 1);
        assert_eq!(h.msgs.len(), 1);
    }

    #[test]
    fn recover_mode_is_sticky_across_calls() {
        let mut demux = RecoverablePsDemuxer::new();
        let mut h = CollectHandler::default();

        let mut garbage = Bytes::from_static(&[0xff; 32]);
        demux.decode_rtp(&mut garbage, 0, &mut h).unwrap();
        assert!(demux.in_recover_mode());
        assert_eq!(garbage.remaining(), 0);

        // Still out of sync: everything is discarded.
        let mut more = Bytes::from_static(&[0xab; 16]);
        demux.decode_rtp(&mut more, 0, &mut h).unwrap();
        assert!(demux.in_recover_mode());

        // A clean pack resumes decoding.
        let mut buf = Vec::new();
        buf.extend_from_slice(&pack_header(5, 0));
        buf.extend_from_slice(&pes(0xc0, 50, None, &[7]));
        let mut clean = Bytes::from(buf);
        demux.decode_rtp(&mut clean, 0, &mut h).unwrap();
        assert!(!demux.in_recover_mode());
        assert_eq!(h.packs.len(), 1);
        assert_eq!(h.msgs.len(), 1);
        assert_eq!(h.recoveries, vec![1]);
    }

    #[test]
    fn reserved_prefix_is_skipped_and_reported() {
        let mut buf = vec![0xaa; 12];
        buf.extend_from_slice(&pack_header(0, 0));

        let mut demux = RecoverablePsDemuxer::new();
        let mut h = CollectHandler::default();
        let mut stream = Bytes::from(buf);
        demux.decode_rtp(&mut stream, 12, &mut h).unwrap();

        assert_eq!(h.reserved, 12);
        assert_eq!(h.packs.len(), 1);
    }

    #[test]
    fn handler_error_is_propagated() {
        struct FailingHandler;
        impl crate::demux::PsMessageHandler for FailingHandler {
            fn on_pack_header(&mut self, _pack: &PsPacket) -> crate::Result<()> {
                Err(Error::Handler("sink is gone".into()))
            }
            fn on_ts_message(&mut self, _msg: TsMessage) -> crate::Result<()> {
                Ok(())
            }
            fn on_recover_mode(&mut self, _recovered: u64) {}
        }

        let mut demux = RecoverablePsDemuxer::new();
        let mut stream = Bytes::from(pack_header(0, 0));
        let err = demux.decode_rtp(&mut stream, 0, &mut FailingHandler).unwrap_err();
        assert!(!err.is_decode());
    }

    #[test]
    fn consumes_all_or_stays_in_recover_mode() {
        // A corpus of byte patterns around the invariant: after decode_rtp
        // the buffer is empty, or the decoder is mid-recovery (also empty).
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x00, 0x00, 0x01],
            vec![0x00, 0x00, 0x01, 0xba],
            vec![0x00, 0x00, 0x01, 0xff, 0x00],
            pack_header(1, 1),
            {
                let mut v = pack_header(1, 1);
                v.truncate(9);
                v
            },
        ];

        for case in cases {
            let mut demux = RecoverablePsDemuxer::new();
            let mut h = CollectHandler::default();
            let mut stream = Bytes::from(case.clone());
            demux.decode_rtp(&mut stream, 0, &mut h).unwrap();
            assert_eq!(stream.remaining(), 0, "case {case:02x?}");
        }
    }
}
