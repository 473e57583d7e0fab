use super::{finish, playlist::activate, stream::is_playlist_source};
use crate::{
    error::ProxyError,
    server::state::AppState,
    session::ClientProfile,
};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Body of `POST /select`
#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub url: String,
}

/// Session selected as the active stream, with ready-to-use player URLs
#[derive(Debug, Serialize, Deserialize)]
pub struct SelectResponse {
    pub session_id: String,
    pub source_url: String,
    pub playlist_url: String,
    pub stream_url: String,
    pub mx_url: String,
}

/// Select the active stream.
///
/// Creates or reuses the browser-profile session for the URL and points the
/// active stream at it. Other sessions are untouched.
pub async fn select_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SelectRequest>,
) -> Response {
    let start = Instant::now();

    let result = (|| {
        let url = request.url.trim();
        if !is_playlist_source(url) {
            return Err(ProxyError::InvalidSource(format!(
                "not an M3U8 playlist URL: {}",
                url
            )));
        }

        let session = activate(&state, url, ClientProfile::Browser)?;
        info!(
            "Active stream is now session {} ({})",
            session.session_id, session.source_url
        );

        let base = public_base(&state, &headers);
        Ok(Json(SelectResponse {
            playlist_url: format!("{}/playlist.m3u8", base),
            stream_url: format!("{}/stream", base),
            mx_url: format!("{}/mx", base),
            session_id: session.session_id,
            source_url: session.source_url,
        })
        .into_response())
    })();

    finish("select", start, result)
}

/// External origin of this relay: `PUBLIC_BASE_URL`, else the request's Host.
fn public_base(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.config.public_base_url {
        return base.clone();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}", host)
}
