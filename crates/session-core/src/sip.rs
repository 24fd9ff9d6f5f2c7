//! The per-connection SIP transaction state machine.
//!
//! One [`SipTcpConn`] per accepted SIP TCP connection. Its transaction task
//! owns two subtasks: a receiver that frames and parses inbound messages,
//! and a sender that drains a FIFO queue onto the socket. Each inbound
//! message first binds the connection to a session (by device id), then
//! drives the state machine:
//!
//! ```text
//! init ──REGISTER──▶ registered ──invite──▶ inviting ──100──▶ trying
//!   │                                        │                  │
//!   └──MESSAGE (reconnect)──▶ stable ◀───200 OK + ACK───────────┘
//!                               │  ▲
//!            BYE from device ───┘  └── re-inviting ◀── reset_to_register
//! ```
//!
//! A receiver failure interrupts the sender, the transaction task exits,
//! and the session observes the transport loss through its weak reference.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use gblink_sip_core::{token, InviteSdp, SipMessage, SipMethod, SipFramer};

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::manager::GbManager;
use crate::session::GbSession;

/// Transaction states of the GB dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipState {
    Init,
    Registered,
    Inviting,
    Trying,
    Reinviting,
    Stable,
    Bye,
}

impl std::fmt::Display for SipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SipState::Init => "init",
            SipState::Registered => "registered",
            SipState::Inviting => "inviting",
            SipState::Trying => "trying",
            SipState::Reinviting => "re-inviting",
            SipState::Stable => "stable",
            SipState::Bye => "bye",
        };
        f.write_str(s)
    }
}

struct SipInner {
    state: SipState,
    /// Stored REGISTER: peer identity for INVITE construction.
    register: Option<SipMessage>,
    /// Stored INVITE 200 OK: dialog identity for ACK and BYE.
    invite_ok: Option<SipMessage>,
    /// Device id learned when the session was bound.
    peer_device: String,
    session: Weak<GbSession>,
    ssrc: u32,
    ssrc_str: String,
    /// Candidate address advertised in the last SDP offer.
    candidate: String,
    cseq: u32,
    invite_cseq: u32,
    from_tag: String,
    call_id: String,
}

pub struct SipTcpConn {
    me: Weak<SipTcpConn>,
    inner: Mutex<SipInner>,
    out_tx: mpsc::UnboundedSender<SipMessage>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<SipMessage>>>,
    interrupt: Interrupt,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: CoreConfig,
    manager: Weak<GbManager>,
}

impl SipTcpConn {
    pub fn new(
        manager: &Arc<GbManager>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<SipTcpConn> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| SipTcpConn {
            me: me.clone(),
            inner: Mutex::new(SipInner {
                state: SipState::Init,
                register: None,
                invite_ok: None,
                peer_device: String::new(),
                session: Weak::new(),
                ssrc: 0,
                ssrc_str: String::new(),
                candidate: String::new(),
                cseq: 0,
                invite_cseq: 0,
                from_tag: String::new(),
                call_id: String::new(),
            }),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            interrupt: Interrupt::new(),
            local_addr,
            peer_addr,
            config: manager.config().clone(),
            manager: Arc::downgrade(manager),
        })
    }

    pub fn state(&self) -> SipState {
        self.inner.lock().state
    }

    pub fn is_registered(&self) -> bool {
        self.state() != SipState::Init
    }

    pub fn is_stable(&self) -> bool {
        self.state() == SipState::Stable
    }

    pub fn is_bye(&self) -> bool {
        self.state() == SipState::Bye
    }

    pub fn device_id(&self) -> String {
        self.inner.lock().peer_device.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// The transaction task: spawns the receiver and sender subtasks and
    /// unwinds both when either fails or the session interrupts us.
    pub async fn cycle(self: Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let rx = self.out_rx.lock().take().expect("cycle started twice");

        let mut receiver = tokio::spawn(receiver_cycle(self.clone(), read_half));
        let sender = tokio::spawn(sender_cycle(self.interrupt.clone(), write_half, rx));

        let receiver_done = tokio::select! {
            _ = self.interrupt.interrupted() => false,
            _ = &mut receiver => true,
        };
        // Receiver failure interrupts the sender; session interrupt stops both.
        self.interrupt.interrupt();
        if !receiver_done {
            let _ = receiver.await;
        }
        let _ = sender.await;

        let session = self.inner.lock().session.clone();
        if let Some(session) = session.upgrade() {
            session.on_sip_transport_gone(&self);
        }
        tracing::debug!(peer = %self.peer_addr, "sip connection closed");
    }

    /// Queue an outbound message; the sender subtask writes it in order.
    fn enqueue(&self, msg: SipMessage) {
        if self.out_tx.send(msg).is_err() {
            tracing::debug!(peer = %self.peer_addr, "sip sender already gone");
        }
    }

    /// Handle one parsed inbound message.
    pub async fn on_sip_message(&self, msg: SipMessage) -> Result<()> {
        tracing::debug!(
            peer = %self.peer_addr,
            device_id = msg.device_id(),
            line = %summary(&msg),
            body = %msg.body_escaped,
            "sip recv"
        );

        if self.inner.lock().session.upgrade().is_none() {
            self.bind_session(&msg).await?;
        }
        self.drive_state(&msg)
    }

    /// Create or look up the session for this device and attach to it.
    async fn bind_session(&self, msg: &SipMessage) -> Result<()> {
        let device_id = msg.device_id().to_string();
        if device_id.is_empty() {
            return Err(Error::SipProtocol("message carries no device id".into()));
        }
        let manager = self.manager.upgrade().ok_or(Error::Cancelled)?;
        let me = self.me.upgrade().ok_or(Error::Cancelled)?;

        let session = manager.find_or_create_session(&device_id);
        session.set_device_id(&device_id).await;
        session.on_sip_transport(me).await;

        let mut inner = self.inner.lock();
        inner.peer_device = device_id;
        inner.session = Arc::downgrade(&session);
        Ok(())
    }

    /// The transaction state machine proper.
    fn drive_state(&self, msg: &SipMessage) -> Result<()> {
        let mut inner = self.inner.lock();

        if msg.is_register() {
            // Authentication is the external SIP server's business; GB
            // intra-domain registration is answered directly.
            self.enqueue(SipMessage::reply_to(msg, 200));
            inner.register = Some(msg.clone());
            if inner.state == SipState::Init {
                Self::set_state(&mut inner, SipState::Registered);
            }
            return Ok(());
        }

        if msg.is_message() {
            // Keepalive or catalog notify; answer and keep going. On a
            // reconnected TCP the session already exists, so the dialog is
            // still live: jump straight to stable.
            self.enqueue(SipMessage::reply_to(msg, 200));
            if inner.state == SipState::Init {
                Self::set_state(&mut inner, SipState::Stable);
            }
            return Ok(());
        }

        if msg.is_trying() {
            if inner.state == SipState::Inviting {
                Self::set_state(&mut inner, SipState::Trying);
            }
            return Ok(());
        }

        if msg.is_invite_ok() {
            match inner.state {
                SipState::Inviting | SipState::Trying => {
                    inner.invite_ok = Some(msg.clone());
                    let ack = self.invite_ack(&inner, msg);
                    self.enqueue(ack);
                    Self::set_state(&mut inner, SipState::Stable);
                }
                state => {
                    tracing::warn!(peer = %self.peer_addr, %state, "unexpected invite 200 ok");
                }
            }
            return Ok(());
        }

        if msg.is_bye() {
            self.enqueue(SipMessage::reply_to(msg, 200));
            Self::set_state(&mut inner, SipState::Bye);
            return Ok(());
        }

        if msg.is_bye_ok() {
            if inner.state == SipState::Reinviting {
                // The old dialog is gone; open a new one with the same SSRC.
                let invite = self.build_invite(&mut inner)?;
                self.enqueue(invite);
                Self::set_state(&mut inner, SipState::Inviting);
            }
            return Ok(());
        }

        if msg.is_invite() {
            // This core is strictly the caller (GB/T 28181 media server
            // pulling from devices); an inbound INVITE has no meaning.
            tracing::warn!(peer = %self.peer_addr, "ignoring inbound invite; gateway is caller-only");
            return Ok(());
        }

        tracing::debug!(peer = %self.peer_addr, line = %summary(msg), "ignored sip message");
        Ok(())
    }

    /// Synthesise and send an INVITE carrying our SDP offer. Returns the
    /// SSRC the media stream must arrive with.
    pub fn invite_request(&self, ssrc_hint: u32, candidate: &str) -> Result<u32> {
        let mut inner = self.inner.lock();
        if inner.state != SipState::Registered {
            return Err(Error::SipProtocol(format!(
                "invite requested in state {}",
                inner.state
            )));
        }

        if ssrc_hint != 0 {
            inner.ssrc = ssrc_hint;
            inner.ssrc_str = format!("{ssrc_hint:010}");
        }
        inner.candidate = candidate.to_string();
        let invite = self.build_invite(&mut inner)?;
        self.enqueue(invite);
        Self::set_state(&mut inner, SipState::Inviting);
        Ok(inner.ssrc)
    }

    /// Reset a stable transport so the session gets a fresh INVITE: send a
    /// BYE first and re-INVITE when it is answered. A transport that never
    /// reached stable just drops back to registered.
    pub fn reset_to_register(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            SipState::Stable => {
                let bye = self.bye_request(&mut inner);
                self.enqueue(bye);
                Self::set_state(&mut inner, SipState::Reinviting);
            }
            SipState::Reinviting | SipState::Bye | SipState::Init => {}
            _ => Self::set_state(&mut inner, SipState::Registered),
        }
    }

    fn build_invite(&self, inner: &mut SipInner) -> Result<SipMessage> {
        // Peer identity comes from the stored REGISTER; a transport revived
        // by a keepalive only knows the device id.
        let (device_user, device_host) = match &inner.register {
            Some(reg) => (
                reg.from_address_user.clone(),
                reg.from_address_host.clone(),
            ),
            None if !inner.peer_device.is_empty() => (
                inner.peer_device.clone(),
                self.config.server_domain.clone(),
            ),
            None => {
                return Err(Error::SipProtocol(
                    "cannot invite without a registered peer".into(),
                ))
            }
        };

        if inner.ssrc == 0 {
            let (ssrc_str, ssrc) = generate_ssrc(self.config.ssrc_domain_flag, &device_user);
            inner.ssrc_str = ssrc_str;
            inner.ssrc = ssrc;
        }

        if inner.from_tag.is_empty() {
            inner.from_tag = token::tag();
        }
        if inner.call_id.is_empty() {
            inner.call_id = token::call_id();
        }
        inner.cseq += 1;
        inner.invite_cseq = inner.cseq;

        let pip = if inner.candidate.is_empty() {
            self.local_addr.ip().to_string()
        } else {
            inner.candidate.clone()
        };

        let mut req = SipMessage::request(SipMethod::Invite, &device_user, &device_host);
        req.via = format!(
            "SIP/2.0/TCP {};rport;branch={}",
            self.local_addr,
            token::branch()
        );
        req.from = format!(
            "<sip:{}@{}>;tag={}",
            self.config.server_id, self.config.server_domain, inner.from_tag
        );
        req.to = format!("<sip:{device_user}@{device_host}>");
        req.call_id = inner.call_id.clone();
        req.cseq_number = inner.cseq;
        req.contact = format!("<sip:{}@{}>", self.config.server_id, self.local_addr);
        req.subject = format!(
            "{}:{},{}:0",
            device_user, inner.ssrc_str, self.config.server_id
        );
        req.content_type = "application/sdp".to_string();
        req.set_body(
            InviteSdp {
                owner_id: device_user,
                candidate: pip,
                media_port: self.config.media_port,
                ssrc: inner.ssrc_str.clone(),
            }
            .render(),
        );
        Ok(req)
    }

    /// The ACK completing the INVITE transaction, addressed per the 200 OK.
    fn invite_ack(&self, inner: &SipInner, ok: &SipMessage) -> SipMessage {
        let (user, host) = if !ok.contact_user.is_empty() {
            (ok.contact_user.clone(), ok.contact_host.clone())
        } else {
            (ok.to_address_user.clone(), ok.to_address_host.clone())
        };

        let mut ack = SipMessage::request(SipMethod::Ack, &user, &host);
        ack.via = format!(
            "SIP/2.0/TCP {};rport;branch={}",
            self.local_addr,
            token::branch()
        );
        ack.from = format!(
            "<sip:{}@{}>;tag={}",
            self.config.server_id, self.config.server_domain, inner.from_tag
        );
        ack.to = ok.to.clone();
        ack.call_id = ok.call_id.clone();
        ack.cseq_number = inner.invite_cseq;
        ack.cseq_method = "ACK".to_string();
        ack
    }

    /// The BYE that tears down the stable dialog ahead of a re-INVITE.
    fn bye_request(&self, inner: &mut SipInner) -> SipMessage {
        let (user, host, to) = match &inner.invite_ok {
            Some(ok) => (
                ok.to_address_user.clone(),
                ok.to_address_host.clone(),
                ok.to.clone(),
            ),
            None => (
                inner.peer_device.clone(),
                self.config.server_domain.clone(),
                format!("<sip:{}@{}>", inner.peer_device, self.config.server_domain),
            ),
        };

        inner.cseq += 1;
        let mut bye = SipMessage::request(SipMethod::Bye, &user, &host);
        bye.via = format!(
            "SIP/2.0/TCP {};rport;branch={}",
            self.local_addr,
            token::branch()
        );
        bye.from = format!(
            "<sip:{}@{}>;tag={}",
            self.config.server_id, self.config.server_domain, inner.from_tag
        );
        bye.to = to;
        bye.call_id = inner.call_id.clone();
        bye.cseq_number = inner.cseq;
        bye
    }

    fn set_state(inner: &mut SipInner, next: SipState) {
        if inner.state != next {
            tracing::info!(
                device_id = %inner.peer_device,
                from = %inner.state,
                to = %next,
                "sip state"
            );
            inner.state = next;
        }
    }
}

/// GB SSRC: domain flag digit, five device-region digits, four random.
/// The flag is clamped so the 10-digit decimal always fits an RTP SSRC.
fn generate_ssrc(domain_flag: u8, device_id: &str) -> (String, u32) {
    let digits: String = device_id.chars().filter(|c| c.is_ascii_digit()).collect();
    let region: String = digits
        .chars()
        .chain(std::iter::repeat('0'))
        .skip(3)
        .take(5)
        .collect();
    let tail: u32 = rand::random::<u32>() % 10_000;
    let ssrc_str = format!("{}{}{:04}", domain_flag.min(3), region, tail);
    let ssrc = ssrc_str.parse::<u32>().unwrap_or(0);
    (ssrc_str, ssrc)
}

fn summary(msg: &SipMessage) -> String {
    match msg.method {
        Some(method) => format!("{method} {}", msg.request_uri),
        None => format!("{} {}", msg.status, msg.cseq_method),
    }
}

/// Reads, frames and parses inbound SIP until the socket or the parser
/// fails, or the transaction is interrupted.
async fn receiver_cycle(conn: Arc<SipTcpConn>, mut read_half: OwnedReadHalf) {
    if let Err(e) = receiver_loop(&conn, &mut read_half).await {
        match e {
            Error::Cancelled => {}
            e => tracing::warn!(peer = %conn.peer_addr, device_id = %conn.device_id(), error = %e, "sip receiver failed"),
        }
    }
}

async fn receiver_loop(conn: &Arc<SipTcpConn>, read_half: &mut OwnedReadHalf) -> Result<()> {
    let mut framer = SipFramer::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = tokio::select! {
            _ = conn.interrupt.interrupted() => return Err(Error::Cancelled),
            r = timeout(conn.config.sip_read_timeout, read_half.read(&mut buf)) => match r {
                Err(_) => return Err(Error::Timeout("sip read")),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(0)) => return Err(Error::Network("sip peer closed".into())),
                Ok(Ok(n)) => n,
            },
        };

        framer.extend(&buf[..n]);
        while let Some(raw) = framer.next_message()? {
            let msg = SipMessage::parse(&raw)?;
            conn.on_sip_message(msg).await?;
        }
    }
}

/// Drains the outbound FIFO onto the socket.
async fn sender_cycle(
    interrupt: Interrupt,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<SipMessage>,
) {
    loop {
        let msg = tokio::select! {
            _ = interrupt.interrupted() => return,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        let text = msg.to_wire();
        tracing::debug!(line = %summary(&msg), body = %msg.body_escaped, "sip send");
        let write = timeout(
            std::time::Duration::from_secs(30),
            write_half.write_all(text.as_bytes()),
        );
        match write.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "sip send failed");
                return;
            }
            Err(_) => {
                tracing::warn!("sip send timed out");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssrc_is_ten_digits_with_flag_and_region() {
        let (s, v) = generate_ssrc(0, "34020000001320000001");
        assert_eq!(s.len(), 10);
        assert!(s.starts_with('0'));
        assert_eq!(&s[1..6], "20000");
        assert_eq!(s.parse::<u32>().unwrap(), v);

        let (s, _) = generate_ssrc(1, "34020000001320000001");
        assert!(s.starts_with('1'));
    }

    #[test]
    fn ssrc_pads_short_device_ids() {
        let (s, v) = generate_ssrc(0, "99");
        assert_eq!(s.len(), 10);
        assert_eq!(&s[1..6], "00000");
        assert!(v < 1_000_000_000);
    }
}
