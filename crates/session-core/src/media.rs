//! The per-connection media task: RTP-over-TCP in, pack bundles out.
//!
//! GB media arrives RFC 4571 framed: a 2-byte big-endian length, then one
//! RTP packet. The first packet's SSRC binds the connection to its session
//! (the SSRC was fixed when the INVITE or publish request was issued); from
//! then on every payload goes through the recoverable PS decoder and the
//! pack context, and completed bundles are forwarded to the session in
//! arrival order.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use gblink_ps_core::{
    PackContext, PackStats, PsPackHandler, PsPacket, RecoverablePsDemuxer, TsMessage,
};

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::manager::GbManager;
use crate::session::GbSession;

/// RTP header length; the PS payload starts after it.
const RTP_HEADER_LEN: usize = 12;

/// Packets tolerated before a session is bound; a peer that streams at us
/// without a negotiated SSRC gets dropped.
const MAX_UNBOUND_PACKETS: u32 = 100;

/// Collects pack bundles inside the decode call; the media task drains it
/// and forwards to the session between reads.
#[derive(Default)]
struct BundleQueue {
    bundles: Vec<(PsPacket, Vec<TsMessage>)>,
}

impl PsPackHandler for BundleQueue {
    fn on_ps_pack(&mut self, pack: &PsPacket, msgs: Vec<TsMessage>) -> gblink_ps_core::Result<()> {
        self.bundles.push((pack.clone(), msgs));
        Ok(())
    }
}

pub struct MediaTcpConn {
    me: Weak<MediaTcpConn>,
    connected: AtomicBool,
    ssrc: AtomicU32,
    nn_rtcp: AtomicU64,
    session: Mutex<Weak<GbSession>>,
    pack_stats: Mutex<PackStats>,
    interrupt: Interrupt,
    manager: Weak<GbManager>,
    config: CoreConfig,
    peer_addr: std::net::SocketAddr,
}

impl MediaTcpConn {
    pub fn new(manager: &Arc<GbManager>, peer_addr: std::net::SocketAddr) -> Arc<MediaTcpConn> {
        Arc::new_cyclic(|me| MediaTcpConn {
            me: me.clone(),
            connected: AtomicBool::new(false),
            ssrc: AtomicU32::new(0),
            nn_rtcp: AtomicU64::new(0),
            session: Mutex::new(Weak::new()),
            pack_stats: Mutex::new(PackStats::default()),
            interrupt: Interrupt::new(),
            manager: Arc::downgrade(manager),
            config: manager.config().clone(),
            peer_addr,
        })
    }

    /// Whether a session is bound and media is flowing.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::SeqCst)
    }

    /// Demux counters, sampled by the session's statistics line.
    pub fn pack_stats(&self) -> PackStats {
        *self.pack_stats.lock()
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub async fn cycle(self: Arc<Self>, stream: TcpStream) {
        let result = self.do_cycle(stream).await;
        self.connected.store(false, Ordering::SeqCst);

        match result {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => {
                tracing::warn!(
                    peer = %self.peer_addr,
                    ssrc = self.ssrc(),
                    rtcp = self.nn_rtcp.load(Ordering::SeqCst),
                    error = %e,
                    "media connection failed"
                );
            }
        }

        let session = self.session.lock().clone();
        if let Some(session) = session.upgrade() {
            session.on_media_transport_gone(&self);
        }
    }

    async fn do_cycle(&self, mut stream: TcpStream) -> Result<()> {
        let mut demux = RecoverablePsDemuxer::new();
        let mut pack = PackContext::new(rand::random::<u32>(), BundleQueue::default());
        let mut unbound: u32 = 0;

        loop {
            // RFC 4571: 2-byte length, then one RTP (or RTCP) packet.
            let frame_len = tokio::select! {
                _ = self.interrupt.interrupted() => return Err(Error::Cancelled),
                r = timeout(self.config.media_read_timeout, stream.read_u16()) => match r {
                    Err(_) => return Err(Error::Timeout("media read")),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(n)) => n as usize,
                },
            };

            let mut buf = BytesMut::zeroed(frame_len);
            tokio::select! {
                _ = self.interrupt.interrupted() => return Err(Error::Cancelled),
                r = timeout(self.config.media_read_timeout, stream.read_exact(&mut buf)) => match r {
                    Err(_) => return Err(Error::Timeout("media read")),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(_)) => {}
                },
            }

            if frame_len < RTP_HEADER_LEN {
                tracing::debug!(peer = %self.peer_addr, frame_len, "runt media frame skipped");
                continue;
            }
            if buf[0] >> 6 != 2 {
                tracing::debug!(peer = %self.peer_addr, "non-rtp frame skipped");
                continue;
            }
            // RFC 5761: packet types 192..=223 in the second byte are RTCP.
            if (192..=223).contains(&buf[1]) {
                self.nn_rtcp.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
            if self.session.lock().upgrade().is_none() {
                if ssrc == 0 {
                    unbound += 1;
                    if unbound > MAX_UNBOUND_PACKETS {
                        return Err(Error::Network("too many packets without a session".into()));
                    }
                    continue;
                }
                self.bind_session(ssrc).await?;
            }

            let mut payload = buf.freeze();
            demux
                .decode_rtp(&mut payload, RTP_HEADER_LEN, &mut pack)
                .map_err(Error::PsDecode)?;
            *self.pack_stats.lock() = pack.stats();

            let bundles = std::mem::take(&mut pack.handler_mut().bundles);
            if bundles.is_empty() {
                continue;
            }
            let session = self.session.lock().upgrade();
            let Some(session) = session else {
                // Session disposed under us; stop feeding it.
                return Err(Error::Cancelled);
            };
            for (ps, msgs) in bundles {
                session.on_ps_pack(&ps, msgs).await?;
            }
        }
    }

    /// Find the session that negotiated `ssrc`, or create one keyed by the
    /// decimal SSRC (external senders may start pushing before the control
    /// plane names the stream).
    async fn bind_session(&self, ssrc: u32) -> Result<()> {
        let manager = self.manager.upgrade().ok_or(Error::Cancelled)?;
        let me = self.me.upgrade().ok_or(Error::Cancelled)?;

        let session = match manager.sessions().find_fast(ssrc as u64) {
            Some(session) => session,
            None => {
                let session = manager.find_or_create_session(&format!("{ssrc:010}"));
                session.bind_ssrc(ssrc);
                session
            }
        };
        session.on_media_transport(me).await;

        *self.session.lock() = Arc::downgrade(&session);
        self.ssrc.store(ssrc, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            peer = %self.peer_addr,
            ssrc,
            device_id = %session.device_id(),
            "media bound to session"
        );
        Ok(())
    }
}
