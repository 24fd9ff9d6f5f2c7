use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use gblink_gateway::{api, listener, Args, GatewayConfig};
use gblink_session_core::GbManager;

// All I/O tasks cooperate on one thread, matching the single-threaded
// scheduling model the session core is written for.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(&args)?;
    tracing::info!(
        sip = %config.sip_listen,
        media = %config.media_listen,
        http = %config.http_listen,
        output = %config.output,
        "gblink starting"
    );

    let manager = GbManager::new(config.core_config()?);

    let sip = TcpListener::bind(&config.sip_listen)
        .await
        .with_context(|| format!("binding sip listener {}", config.sip_listen))?;
    let media = TcpListener::bind(&config.media_listen)
        .await
        .with_context(|| format!("binding media listener {}", config.media_listen))?;
    let http = TcpListener::bind(&config.http_listen)
        .await
        .with_context(|| format!("binding http listener {}", config.http_listen))?;

    tokio::spawn(listener::run_sip_listener(manager.clone(), sip));
    tokio::spawn(listener::run_media_listener(manager.clone(), media));
    let app = api::router(manager.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http, app).await {
            tracing::error!(error = %e, "http api failed");
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down, draining sessions");
    manager.interrupt_all();

    // Give session tasks a moment to unwind and release their resources.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.sessions().len() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tracing::info!(remaining = manager.sessions().len(), "bye");
    Ok(())
}
