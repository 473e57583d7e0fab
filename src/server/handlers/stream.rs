use super::{
    finish,
    playlist::{activate, active_session, serve_session_playlist},
    source_param,
};
use crate::{
    error::{ProxyError, Result},
    hls::UriKind,
    relay::{self, PLAYLIST_CHUNK_SIZE, StreamTimeout},
    server::{state::AppState, url_validation::validate_source_url},
    session::{ClientProfile, profile::upstream_headers},
};
use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// Generic player endpoint.
///
/// Playlist sources go through the playlist path; anything else is relayed
/// as direct video. Clients identifying as MX Player get the MX profile.
pub async fn serve_stream(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    let profile = ClientProfile::for_client(
        headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok()),
    );
    let range = headers.get(header::RANGE);

    let result = async {
        let Some(url) = source_param(query.as_deref()) else {
            let session = active_session(&state)?;
            let entry = serve_session_playlist(&state, &session).await?;
            return Ok::<_, ProxyError>(relay::playlist_response(&entry));
        };

        if is_playlist_source(&url) {
            let session = activate(&state, &url, profile)?;
            let entry = serve_session_playlist(&state, &session).await?;
            return Ok(relay::playlist_response(&entry));
        }

        direct_video(&state, &url, profile, range).await
    }
    .await;

    finish("stream", start, result)
}

/// Whether a source URL should be treated as an HLS playlist.
///
/// Looser than [`UriKind::of`]: sources like `/live?format=m3u8` count too.
pub(crate) fn is_playlist_source(url: &str) -> bool {
    UriKind::of(url) == UriKind::Playlist || url.to_ascii_lowercase().contains("m3u8")
}

/// Relay a non-HLS video in 1 MiB chunks, forwarding `Range`.
///
/// Direct video has no session; upstream headers come straight from the
/// profile. The timeout bounds the response head and each stall between
/// body chunks, never the whole transfer.
pub(crate) async fn direct_video(
    state: &AppState,
    url: &str,
    profile: ClientProfile,
    range: Option<&HeaderValue>,
) -> Result<Response> {
    validate_source_url(url, state.config.allow_private_upstreams)?;
    info!("Relaying direct video ({}): {}", profile.as_str(), url);

    let headers = upstream_headers(profile, url, &state.config.header_overrides());
    let upstream = relay::open_stream(
        &state.http_client,
        &headers,
        url,
        range,
        StreamTimeout::Idle(state.config.segment_timeout()),
    )
    .await?;

    Ok(upstream.into_response(None, PLAYLIST_CHUNK_SIZE))
}
