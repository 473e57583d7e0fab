use crate::server::state::AppState;
use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    pub active_sessions: usize,
    /// Id of the session currently served without `?url=`
    pub active_stream: Option<String>,
    pub cached_playlists: usize,
    pub uptime_seconds: u64,
}

/// Liveness plus a snapshot of registry and cache sizes
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let active_sessions = state.sessions.session_count();
    crate::metrics::set_active_sessions(active_sessions);

    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        active_sessions,
        active_stream: state.sessions.active_id(),
        cached_playlists: state.cache.len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeepaliveResponse {
    pub status: String,
    pub timestamp: String,
    pub sessions: usize,
}

/// Cheap ping for hosts that idle out unvisited services.
pub async fn keepalive(State(state): State<AppState>) -> Json<KeepaliveResponse> {
    Json(KeepaliveResponse {
        status: "alive".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        sessions: state.sessions.session_count(),
    })
}
