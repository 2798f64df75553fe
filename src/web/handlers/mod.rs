use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::broadcast::BroadcastStats;
use crate::signal::WsTransport;
use crate::state::AppState;

// ============================================================================
// Health & Status
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Identity of the broadcast stream
#[derive(Serialize)]
pub struct StreamInfo {
    pub codec: String,
    pub track_id: String,
    pub stream_id: String,
    pub clock_rate: u32,
}

/// Broadcast status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub ingest_address: String,
    pub max_viewers: usize,
    pub stream: StreamInfo,
    pub broadcast: BroadcastStats,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let track = state.broadcast.stream();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        ingest_address: state.config.ingest.bind_address.clone(),
        max_viewers: state.config.broadcast.max_viewers,
        stream: StreamInfo {
            codec: track.codec.to_string(),
            track_id: track.track_id.clone(),
            stream_id: track.stream_id.clone(),
            clock_rate: track.clock_rate,
        },
        broadcast: state.broadcast.stats().await,
    })
}

// ============================================================================
// Signaling
// ============================================================================

/// Viewer signaling WebSocket
///
/// Each connection becomes one viewer; the server sends the offer as soon as
/// the socket is upgraded.
pub async fn signal_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        match state.broadcast.add_viewer(WsTransport::new(socket)).await {
            Ok(session_id) => debug!("Viewer {} signaling over WebSocket", session_id),
            Err(e) => debug!("WebSocket viewer not admitted: {}", e),
        }
    })
}
