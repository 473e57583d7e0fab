//! Prometheus metrics endpoint.

use crate::server::state::AppState;
use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

/// GET /metrics -- Prometheus text exposition.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = match &state.metrics {
        Some(handle) => handle.render(),
        None => "# No metrics recorder installed\n".to_string(),
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
