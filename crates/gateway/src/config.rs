//! File + CLI configuration.
//!
//! A TOML file carries the full configuration; a handful of CLI flags
//! override the common fields for quick runs. Anything unset falls back to
//! GB-conventional defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use gblink_session_core::CoreConfig;

#[derive(Parser, Debug, Default)]
#[command(name = "gblink", about = "GB28181 to RTMP ingestion gateway", version)]
pub struct Args {
    /// TOML configuration file.
    #[arg(long, default_value = "gblink.toml")]
    pub config: PathBuf,

    /// SIP listen address, e.g. 0.0.0.0:5060.
    #[arg(long)]
    pub sip_listen: Option<String>,

    /// Media (RTP over TCP) listen address, e.g. 0.0.0.0:9000.
    #[arg(long)]
    pub media_listen: Option<String>,

    /// HTTP control API listen address, e.g. 0.0.0.0:2985.
    #[arg(long)]
    pub http_listen: Option<String>,

    /// RTMP output template; `[stream]` is replaced by the device id.
    #[arg(long)]
    pub output: Option<String>,

    /// Public IPv4 for SDP, or `*` to derive it from the SIP socket.
    #[arg(long)]
    pub candidate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub sip_listen: String,
    pub media_listen: String,
    pub http_listen: String,
    pub output: String,
    pub candidate: String,
    pub ssrc_domain_flag: u8,
    pub server_id: String,
    pub server_domain: String,
    pub connecting_timeout_secs: u64,
    pub timeout_threshold: u32,
    pub reinvite_wait_secs: u64,
    pub sip_read_timeout_secs: u64,
    pub media_read_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let core = CoreConfig::default();
        Self {
            sip_listen: "0.0.0.0:5060".to_string(),
            media_listen: "0.0.0.0:9000".to_string(),
            http_listen: "0.0.0.0:2985".to_string(),
            output: core.output,
            candidate: core.candidate,
            ssrc_domain_flag: core.ssrc_domain_flag,
            server_id: core.server_id,
            server_domain: core.server_domain,
            connecting_timeout_secs: core.connecting_timeout.as_secs(),
            timeout_threshold: core.timeout_threshold,
            reinvite_wait_secs: core.reinvite_wait.as_secs(),
            sip_read_timeout_secs: core.sip_read_timeout.as_secs(),
            media_read_timeout_secs: core.media_read_timeout.as_secs(),
        }
    }
}

impl GatewayConfig {
    /// Load the file named by `args` (missing file means defaults) and
    /// apply CLI overrides.
    pub fn load(args: &Args) -> anyhow::Result<GatewayConfig> {
        let mut config = match std::fs::read_to_string(&args.config) {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("parsing {}", args.config.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GatewayConfig::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", args.config.display()))
            }
        };

        if let Some(v) = &args.sip_listen {
            config.sip_listen = v.clone();
        }
        if let Some(v) = &args.media_listen {
            config.media_listen = v.clone();
        }
        if let Some(v) = &args.http_listen {
            config.http_listen = v.clone();
        }
        if let Some(v) = &args.output {
            config.output = v.clone();
        }
        if let Some(v) = &args.candidate {
            config.candidate = v.clone();
        }
        Ok(config)
    }

    /// The session-core view of this configuration.
    pub fn core_config(&self) -> anyhow::Result<CoreConfig> {
        let media_port = self
            .media_listen
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .with_context(|| format!("media_listen has no port: {}", self.media_listen))?;

        Ok(CoreConfig {
            candidate: self.candidate.clone(),
            output: self.output.clone(),
            media_port,
            ssrc_domain_flag: self.ssrc_domain_flag,
            server_id: self.server_id.clone(),
            server_domain: self.server_domain.clone(),
            connecting_timeout: Duration::from_secs(self.connecting_timeout_secs),
            timeout_threshold: self.timeout_threshold,
            reinvite_wait: Duration::from_secs(self.reinvite_wait_secs),
            sip_read_timeout: Duration::from_secs(self.sip_read_timeout_secs),
            media_read_timeout: Duration::from_secs(self.media_read_timeout_secs),
            ..CoreConfig::default()
        })
    }
}
