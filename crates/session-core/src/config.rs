//! Tunables shared by sessions and their transports.

use std::time::Duration;

/// Runtime configuration for the session core. The gateway binary builds
/// this from its own file/CLI configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Public IPv4 advertised in SDP, or `*` to use the accept-side address
    /// of the SIP connection.
    pub candidate: String,
    /// RTMP output template, `[stream]` replaced by the device id.
    pub output: String,
    /// The media (RTP over TCP) listen port advertised in SDP offers and by
    /// the control API.
    pub media_port: u16,
    /// Leading digit of generated SSRCs (GB domain flag; 0 = live).
    pub ssrc_domain_flag: u8,
    /// GB id this gateway signs INVITEs with.
    pub server_id: String,
    /// GB domain this gateway signs INVITEs with.
    pub server_domain: String,
    /// Wall-clock budget for reaching Established.
    pub connecting_timeout: Duration,
    /// Connecting timeouts tolerated before the session is disposed.
    pub timeout_threshold: u32,
    /// Grace after media loss before forcing a fresh INVITE.
    pub reinvite_wait: Duration,
    /// Session driver tick.
    pub drive_interval: Duration,
    /// Cadence of the per-session statistics log line.
    pub stats_interval: Duration,
    /// Read deadline on the SIP connection.
    pub sip_read_timeout: Duration,
    /// Idle deadline on the media connection.
    pub media_read_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            candidate: "*".to_string(),
            output: "rtmp://127.0.0.1/live/[stream]".to_string(),
            media_port: 9000,
            ssrc_domain_flag: 0,
            server_id: "34020000002000000001".to_string(),
            server_domain: "3402000000".to_string(),
            connecting_timeout: Duration::from_secs(60),
            timeout_threshold: 3,
            reinvite_wait: Duration::from_secs(5),
            drive_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(5),
            sip_read_timeout: Duration::from_secs(30),
            media_read_timeout: Duration::from_secs(5),
        }
    }
}
