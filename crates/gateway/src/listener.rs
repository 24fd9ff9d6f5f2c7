//! SIP and media accept loops.
//!
//! Each accepted socket gets its own connection object and task; the
//! connection binds itself to a session on first contact and releases its
//! registry references when the task unwinds.

use std::sync::Arc;

use tokio::net::TcpListener;

use gblink_session_core::{GbManager, MediaTcpConn, SipTcpConn};

pub async fn run_sip_listener(manager: Arc<GbManager>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "sip accept failed");
                continue;
            }
        };
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(error = %e, "sip local addr unavailable");
                continue;
            }
        };
        tracing::info!(%peer, "sip connection accepted");
        let conn = SipTcpConn::new(&manager, local, peer);
        tokio::spawn(conn.cycle(stream));
    }
}

pub async fn run_media_listener(manager: Arc<GbManager>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "media accept failed");
                continue;
            }
        };
        tracing::info!(%peer, "media connection accepted");
        let conn = MediaTcpConn::new(&manager, peer);
        tokio::spawn(conn.cycle(stream));
    }
}
