//! The HTTP control surface for external-SIP-server deployments.
//!
//! When signaling lives in a separate SIP server, that server announces each
//! stream here: `POST /gb/v1/publish/` with the stream id and the SSRC it
//! negotiated. The gateway then accepts the matching RTP-over-TCP stream on
//! its media port and publishes it under the given id, no REGISTER needed.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use gblink_session_core::GbManager;

#[derive(Debug, Deserialize)]
struct PublishRequest {
    id: Option<String>,
    ssrc: Option<String>,
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    port: u16,
    is_tcp: bool,
}

#[derive(Debug, Serialize)]
struct ApiError {
    code: u16,
    error: String,
}

pub fn router(manager: Arc<GbManager>) -> Router {
    Router::new()
        .route("/gb/v1/publish/", post(publish))
        .with_state(manager)
}

async fn publish(
    State(manager): State<Arc<GbManager>>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, (StatusCode, Json<ApiError>)> {
    let id = match req.id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => return Err(bad_request("no id")),
    };
    let ssrc: u32 = match req.ssrc.as_deref().map(|s| s.trim().parse()) {
        Some(Ok(ssrc)) if ssrc != 0 => ssrc,
        Some(Ok(_)) => return Err(bad_request("ssrc must not be zero")),
        Some(Err(_)) => return Err(bad_request("ssrc must be a decimal u32")),
        None => return Err(bad_request("no ssrc")),
    };

    let session = manager.find_or_create_session(id);
    // External mode: the stream keeps the announced id even if a device
    // never registers.
    session.set_device_id(id).await;
    session.bind_ssrc(ssrc);
    tracing::info!(id, ssrc, "publish announced via control api");

    Ok(Json(PublishResponse { port: manager.config().media_port, is_tcp: true }))
}

fn bad_request(reason: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError { code: 400, error: reason.to_string() }),
    )
}
