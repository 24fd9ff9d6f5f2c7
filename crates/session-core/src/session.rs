//! The GB session coordinator.
//!
//! A session binds one SIP transport (by device id) and one media transport
//! (by SSRC), owns the RTMP muxer, and runs a periodic driver that walks
//! Init → Connecting → Established. Media loss sends it back to Connecting
//! and, once the SIP side is still stable after a short wait, forces a
//! fresh INVITE. Repeated connecting timeouts dispose the session.
//!
//! Ownership is one-directional: the registry and tasks hold `Arc`s to the
//! session; transports refer back through `Weak` handles so a dead session
//! can never be kept alive by its own sockets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use gblink_media_core::GbMuxer;
use gblink_ps_core::{PsPacket, TsMessage};

use crate::config::CoreConfig;
use crate::error::Result;
use crate::interrupt::Interrupt;
use crate::manager::GbManager;
use crate::media::MediaTcpConn;
use crate::sip::{SipState, SipTcpConn};

/// Session lifecycle. A session may fall back from Established to
/// Connecting on media loss; it never returns to Init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Established,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::Connecting => "connecting",
            SessionState::Established => "established",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct SessionStats {
    total_packs: u64,
    total_msgs: u64,
    media_restarts: u32,
}

struct Timing {
    connecting_start: Instant,
    media_lost_at: Option<Instant>,
    nn_timeout: u32,
    last_stats: Instant,
}

pub struct GbSession {
    me: Weak<GbSession>,
    id: String,
    /// Key under which the manager registered us; never changes.
    registry_key: String,
    device_id: Mutex<String>,
    state: Mutex<SessionState>,
    manager: Weak<GbManager>,
    config: CoreConfig,

    sip: Mutex<Option<Arc<SipTcpConn>>>,
    media: Mutex<Option<Arc<MediaTcpConn>>>,
    muxer: tokio::sync::Mutex<GbMuxer>,

    ssrc: AtomicU32,
    /// Public IP used in SDP; resolved from config or the SIP socket.
    pip: Mutex<String>,

    timing: Mutex<Timing>,
    stats: Mutex<SessionStats>,
    interrupt: Interrupt,
}

impl GbSession {
    pub fn new(manager: &Arc<GbManager>, device_id: &str) -> Arc<GbSession> {
        let config = manager.config().clone();
        let pip = if config.candidate == "*" {
            String::new()
        } else {
            config.candidate.clone()
        };
        Arc::new_cyclic(|me| GbSession {
            me: me.clone(),
            id: Uuid::new_v4().to_string(),
            registry_key: device_id.to_string(),
            device_id: Mutex::new(device_id.to_string()),
            state: Mutex::new(SessionState::Init),
            manager: Arc::downgrade(manager),
            muxer: tokio::sync::Mutex::new(GbMuxer::new(config.output.clone())),
            config,
            sip: Mutex::new(None),
            media: Mutex::new(None),
            ssrc: AtomicU32::new(0),
            pip: Mutex::new(pip),
            timing: Mutex::new(Timing {
                connecting_start: Instant::now(),
                media_lost_at: None,
                nn_timeout: 0,
                last_stats: Instant::now(),
            }),
            stats: Mutex::new(SessionStats::default()),
            interrupt: Interrupt::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> String {
        self.device_id.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::SeqCst)
    }

    /// Rename the session's stream. The control API forces the id in
    /// external-SIP-server mode; the SIP binding sets it from REGISTER.
    pub async fn set_device_id(&self, device_id: &str) {
        *self.device_id.lock() = device_id.to_string();
        self.muxer.lock().await.set_stream_name(device_id);
    }

    /// Fix the SSRC and index the session under it, so the media listener
    /// can bind incoming RTP back to us.
    pub fn bind_ssrc(&self, ssrc: u32) {
        self.ssrc.store(ssrc, Ordering::SeqCst);
        if let (Some(manager), Some(me)) = (self.manager.upgrade(), self.me.upgrade()) {
            manager.sessions().insert_fast(ssrc as u64, me);
        }
    }

    /// A SIP transport bound to this session (fresh connection or
    /// reconnect). Replaces any previous one.
    pub async fn on_sip_transport(&self, sip: Arc<SipTcpConn>) {
        if self.config.candidate == "*" {
            *self.pip.lock() = sip.local_addr().ip().to_string();
        }
        self.muxer.lock().await.set_stream_name(&self.device_id());
        let old = self.sip.lock().replace(sip);
        if let Some(old) = old {
            old.interrupt();
        }
    }

    pub fn on_sip_transport_gone(&self, gone: &Arc<SipTcpConn>) {
        let mut sip = self.sip.lock();
        if let Some(current) = sip.as_ref() {
            if Arc::ptr_eq(current, gone) {
                *sip = None;
                tracing::info!(device_id = %self.device_id(), "sip transport released");
            }
        }
    }

    /// A media transport matched our SSRC. Re-arms the muxer's sequence
    /// headers since the frame sequence restarts.
    pub async fn on_media_transport(&self, media: Arc<MediaTcpConn>) {
        self.muxer.lock().await.reset();
        self.stats.lock().media_restarts += 1;
        let old = self.media.lock().replace(media);
        if let Some(old) = old {
            old.interrupt();
        }
    }

    pub fn on_media_transport_gone(&self, gone: &Arc<MediaTcpConn>) {
        let mut media = self.media.lock();
        if let Some(current) = media.as_ref() {
            if Arc::ptr_eq(current, gone) {
                *media = None;
                tracing::info!(device_id = %self.device_id(), "media transport released");
            }
        }
    }

    /// One pack's worth of TS messages, in pack-arrival order.
    pub async fn on_ps_pack(&self, _pack: &PsPacket, msgs: Vec<TsMessage>) -> Result<()> {
        {
            let mut stats = self.stats.lock();
            stats.total_packs += 1;
            stats.total_msgs += msgs.len() as u64;
        }
        let mut muxer = self.muxer.lock().await;
        for msg in &msgs {
            muxer.on_ts_message(msg).await?;
        }
        Ok(())
    }

    /// Request disposal; the driver task notices and unwinds everything.
    pub fn dispose(&self) {
        self.interrupt.interrupt();
    }

    /// The periodic driver task.
    pub async fn cycle(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.interrupt.interrupted() => break,
                _ = tokio::time::sleep(self.config.drive_interval) => {
                    if !self.drive_state() {
                        break;
                    }
                    self.maybe_log_stats().await;
                }
            }
        }

        self.interrupt.interrupt();
        if let Some(sip) = self.sip.lock().take() {
            sip.interrupt();
        }
        if let Some(media) = self.media.lock().take() {
            media.interrupt();
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.sessions().remove(&self.registry_key);
            let ssrc = self.ssrc();
            if ssrc != 0 {
                manager.sessions().remove_fast(ssrc as u64);
            }
        }

        let stats = self.stats.lock();
        tracing::info!(
            device_id = %self.device_id(),
            ssrc = self.ssrc(),
            packs = stats.total_packs,
            msgs = stats.total_msgs,
            media_restarts = stats.media_restarts,
            "session disposed"
        );
    }

    /// One driver tick. Returns false when the session must dispose.
    fn drive_state(&self) -> bool {
        let sip = self.sip.lock().clone();
        let media = self.media.lock().clone();
        let sip_state = sip.as_ref().map(|s| s.state());
        let media_connected = media.as_ref().map(|m| m.is_connected()).unwrap_or(false);

        if matches!(sip_state, Some(SipState::Bye)) {
            tracing::info!(device_id = %self.device_id(), "device said bye, disposing session");
            return false;
        }

        match self.state() {
            SessionState::Init => {
                if matches!(sip_state, Some(SipState::Registered)) {
                    self.set_state(SessionState::Connecting);
                    self.timing.lock().connecting_start = Instant::now();
                    if !media_connected {
                        if let Some(sip) = &sip {
                            self.try_invite(sip);
                        }
                    }
                }
            }
            SessionState::Connecting => {
                if matches!(sip_state, Some(SipState::Stable)) && media_connected {
                    self.timing.lock().nn_timeout = 0;
                    self.set_state(SessionState::Established);
                    tracing::info!(
                        device_id = %self.device_id(),
                        ssrc = self.ssrc(),
                        "stream established"
                    );
                    return true;
                }

                // A (re-)registered SIP side with no media yet wants an INVITE.
                if matches!(sip_state, Some(SipState::Registered)) && !media_connected {
                    if let Some(sip) = &sip {
                        self.try_invite(sip);
                    }
                }

                // After media loss, give the device a grace period to
                // reconnect on its own before tearing the dialog down.
                let reinvite_due = {
                    let mut timing = self.timing.lock();
                    match timing.media_lost_at {
                        Some(lost)
                            if !media_connected
                                && lost.elapsed() >= self.config.reinvite_wait =>
                        {
                            timing.media_lost_at = None;
                            true
                        }
                        _ => false,
                    }
                };
                if reinvite_due && matches!(sip_state, Some(SipState::Stable)) {
                    if let Some(sip) = &sip {
                        tracing::info!(device_id = %self.device_id(), "media lost, forcing re-invite");
                        sip.reset_to_register();
                    }
                }

                let mut timing = self.timing.lock();
                if timing.connecting_start.elapsed() > self.config.connecting_timeout {
                    timing.nn_timeout += 1;
                    timing.connecting_start = Instant::now();
                    tracing::warn!(
                        device_id = %self.device_id(),
                        nn_timeout = timing.nn_timeout,
                        "connecting timeout"
                    );
                    if timing.nn_timeout > self.config.timeout_threshold {
                        return false;
                    }
                    drop(timing);
                    if matches!(sip_state, Some(SipState::Stable)) {
                        if let Some(sip) = &sip {
                            sip.reset_to_register();
                        }
                    }
                }
            }
            SessionState::Established => {
                if !media_connected {
                    tracing::warn!(device_id = %self.device_id(), "media disconnected");
                    self.set_state(SessionState::Connecting);
                    let mut timing = self.timing.lock();
                    timing.connecting_start = Instant::now();
                    timing.media_lost_at = Some(Instant::now());
                }
            }
        }
        true
    }

    fn try_invite(&self, sip: &Arc<SipTcpConn>) {
        let hint = self.ssrc();
        let pip = self.pip.lock().clone();
        if pip.is_empty() {
            tracing::warn!(device_id = %self.device_id(), "no candidate address for sdp yet");
            return;
        }
        match sip.invite_request(hint, &pip) {
            Ok(ssrc) => {
                if hint == 0 {
                    self.bind_ssrc(ssrc);
                }
            }
            Err(e) => {
                tracing::warn!(device_id = %self.device_id(), error = %e, "invite failed");
            }
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::info!(
                device_id = %self.device_id(),
                from = %*state,
                to = %next,
                "session state"
            );
            *state = next;
        }
    }

    async fn maybe_log_stats(&self) {
        {
            let mut timing = self.timing.lock();
            if timing.last_stats.elapsed() < self.config.stats_interval {
                return;
            }
            timing.last_stats = Instant::now();
        }

        let (packs, msgs) = {
            let stats = self.stats.lock();
            (stats.total_packs, stats.total_msgs)
        };
        let pack_stats = self
            .media
            .lock()
            .as_ref()
            .map(|m| m.pack_stats())
            .unwrap_or_default();
        let muxer_stats = match self.muxer.try_lock() {
            Ok(muxer) => muxer.stats(),
            Err(_) => return,
        };

        tracing::info!(
            device_id = %self.device_id(),
            ssrc = self.ssrc(),
            state = %self.state(),
            packs,
            msgs,
            recovered = pack_stats.recovered,
            dropped = pack_stats.msgs_dropped,
            reserved = pack_stats.reserved,
            frames_out = muxer_stats.frames_out,
            frames_dropped = muxer_stats.msgs_dropped,
            rtmp_reconnects = muxer_stats.reconnects,
            "session stats"
        );
    }
}
