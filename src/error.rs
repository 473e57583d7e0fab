use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the relay engine.
///
/// Every variant is scoped to a single request: none of them is fatal to the
/// process or leaves shared registry/cache state half-written.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing, malformed or disallowed source URL (client error, never retried)
    #[error("Invalid source URL: {0}")]
    InvalidSource(String),

    /// Network failure or timeout while talking to the upstream
    #[error("Upstream unreachable ({url}): {reason}")]
    UpstreamUnreachable {
        url: String,
        reason: String,
        timed_out: bool,
    },

    /// Upstream answered with a non-2xx status
    #[error("Upstream returned HTTP {status} for {url}")]
    UpstreamError { url: String, status: u16 },

    /// Segment or playlist request for an unknown or evicted session
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Playlist failed structural validation. Logged and rewritten
    /// best-effort; only reaches a client if a caller chooses to surface it.
    #[error("Malformed playlist: {0}")]
    MalformedPlaylist(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status this error maps to downstream.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidSource(_) => StatusCode::BAD_REQUEST,
            ProxyError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnreachable {
                timed_out: true, ..
            } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamUnreachable { .. }
            | ProxyError::UpstreamError { .. }
            | ProxyError::MalformedPlaylist(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidSource(_) => "invalid_source",
            ProxyError::UpstreamUnreachable { .. } => "upstream_unreachable",
            ProxyError::UpstreamError { .. } => "upstream_error",
            ProxyError::SessionNotFound(_) => "session_not_found",
            ProxyError::MalformedPlaylist(_) => "malformed_playlist",
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProxyError::UpstreamUnreachable { .. })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!(status = %status, error = %self, "Relay request failed");
        }

        (
            status,
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            format!("{}\n", self),
        )
            .into_response()
    }
}
