//! The RTMP publish client.
//!
//! The chunk stream, AMF command flow and handshake come from `rml_rtmp`;
//! this wrapper owns the TCP socket and walks the session through
//! handshake → connect(app) → publish(stream), then pushes audio/video tag
//! payloads. The muxer treats any error here as "connection lost" and
//! reconnects with a kickoff delay.

use std::time::Duration;

use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A split `rtmp://host[:port]/app/stream` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream: String,
}

impl RtmpUrl {
    pub fn parse(url: &str) -> Result<RtmpUrl> {
        let rest = url
            .strip_prefix("rtmp://")
            .ok_or_else(|| Error::RtmpUrl(url.to_string()))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::RtmpUrl(url.to_string()))?;
        let (app, stream) = path
            .split_once('/')
            .ok_or_else(|| Error::RtmpUrl(url.to_string()))?;
        if authority.is_empty() || app.is_empty() || stream.is_empty() {
            return Err(Error::RtmpUrl(url.to_string()));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().map_err(|_| Error::RtmpUrl(url.to_string()))?,
            ),
            None => (authority.to_string(), 1935),
        };
        Ok(RtmpUrl { host, port, app: app.to_string(), stream: stream.to_string() })
    }

    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

enum WaitFor {
    ConnectionAccepted,
    PublishAccepted,
}

/// An established, publishing RTMP connection.
pub struct RtmpClient {
    stream: TcpStream,
    session: ClientSession,
}

impl RtmpClient {
    /// Connect, handshake and start publishing on `url.stream`.
    pub async fn connect(url: &RtmpUrl) -> Result<RtmpClient> {
        let mut stream = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((url.host.as_str(), url.port)),
        )
        .await??;
        stream.set_nodelay(true).ok();

        // Plain RTMP handshake.
        let mut handshake = Handshake::new(PeerType::Client);
        let p0p1 = handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| Error::Rtmp(format!("handshake: {e:?}")))?;
        stream.write_all(&p0p1).await?;

        let mut buf = vec![0u8; 8192];
        let leftover = loop {
            let n = timeout(IO_TIMEOUT, stream.read(&mut buf)).await??;
            if n == 0 {
                return Err(Error::Rtmp("server closed during handshake".into()));
            }
            match handshake
                .process_bytes(&buf[..n])
                .map_err(|e| Error::Rtmp(format!("handshake: {e:?}")))?
            {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes).await?;
                    }
                }
                HandshakeProcessResult::Completed { response_bytes, remaining_bytes } => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes).await?;
                    }
                    break remaining_bytes;
                }
            }
        };

        let mut config = ClientSessionConfig::new();
        config.tc_url = Some(url.tc_url());
        let (session, initial) =
            ClientSession::new(config).map_err(|e| Error::Rtmp(format!("session: {e:?}")))?;

        let mut client = RtmpClient { stream, session };
        client.dispatch_all(initial).await?;
        if !leftover.is_empty() {
            let results = client
                .session
                .handle_input(&leftover)
                .map_err(|e| Error::Rtmp(format!("session: {e:?}")))?;
            client.dispatch_all(results).await?;
        }

        let result = client
            .session
            .request_connection(url.app.clone())
            .map_err(|e| Error::Rtmp(format!("connect request: {e:?}")))?;
        client.dispatch(result).await?;
        client.wait_for(WaitFor::ConnectionAccepted).await?;

        let result = client
            .session
            .request_publishing(url.stream.clone(), PublishRequestType::Live)
            .map_err(|e| Error::Rtmp(format!("publish request: {e:?}")))?;
        client.dispatch(result).await?;
        client.wait_for(WaitFor::PublishAccepted).await?;

        tracing::debug!(host = %url.host, app = %url.app, stream = %url.stream, "rtmp publishing");
        Ok(client)
    }

    /// Send one video tag payload.
    pub async fn publish_video(&mut self, timestamp: u32, payload: Bytes) -> Result<()> {
        self.drain_incoming().await?;
        let result = self
            .session
            .publish_video_data(payload, RtmpTimestamp::new(timestamp), false)
            .map_err(|e| Error::Rtmp(format!("video: {e:?}")))?;
        self.dispatch(result).await
    }

    /// Send one audio tag payload.
    pub async fn publish_audio(&mut self, timestamp: u32, payload: Bytes) -> Result<()> {
        self.drain_incoming().await?;
        let result = self
            .session
            .publish_audio_data(payload, RtmpTimestamp::new(timestamp), false)
            .map_err(|e| Error::Rtmp(format!("audio: {e:?}")))?;
        self.dispatch(result).await
    }

    /// Feed any pending server bytes (acks, bandwidth messages) through the
    /// session without blocking.
    async fn drain_incoming(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => return Err(Error::Io("rtmp server closed the connection".into())),
                Ok(n) => {
                    let results = self
                        .session
                        .handle_input(&buf[..n])
                        .map_err(|e| Error::Rtmp(format!("session: {e:?}")))?;
                    self.dispatch_all(results).await?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn dispatch_all(&mut self, results: Vec<ClientSessionResult>) -> Result<()> {
        for result in results {
            self.dispatch_inner(result, None).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, result: ClientSessionResult) -> Result<()> {
        self.dispatch_inner(result, None).await
    }

    /// Read until the server raises the awaited event.
    async fn wait_for(&mut self, want: WaitFor) -> Result<()> {
        let mut buf = vec![0u8; 8192];
        let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
        loop {
            let n = timeout(
                deadline.saturating_duration_since(tokio::time::Instant::now()),
                self.stream.read(&mut buf),
            )
            .await??;
            if n == 0 {
                return Err(Error::Rtmp("server closed before accepting".into()));
            }
            let results = self
                .session
                .handle_input(&buf[..n])
                .map_err(|e| Error::Rtmp(format!("session: {e:?}")))?;
            let mut done = false;
            for result in results {
                self.dispatch_inner(result, Some((&want, &mut done))).await?;
            }
            if done {
                return Ok(());
            }
        }
    }

    async fn dispatch_inner(
        &mut self,
        result: ClientSessionResult,
        waiting: Option<(&WaitFor, &mut bool)>,
    ) -> Result<()> {
        match result {
            ClientSessionResult::OutboundResponse(packet) => {
                self.stream.write_all(&packet.bytes).await?;
            }
            ClientSessionResult::RaisedEvent(event) => match (&event, waiting) {
                (ClientSessionEvent::ConnectionRequestAccepted, Some((WaitFor::ConnectionAccepted, done))) => {
                    *done = true;
                }
                (ClientSessionEvent::PublishRequestAccepted, Some((WaitFor::PublishAccepted, done))) => {
                    *done = true;
                }
                (ClientSessionEvent::ConnectionRequestRejected { description }, _) => {
                    return Err(Error::Rtmp(format!("connection rejected: {description}")));
                }
                _ => tracing::trace!(?event, "rtmp event"),
            },
            ClientSessionResult::UnhandleableMessageReceived(_) => {}
        }
        Ok(())
    }
}
