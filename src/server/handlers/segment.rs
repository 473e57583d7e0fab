use super::{finish, playlist::load_playlist};
use crate::{
    error::ProxyError,
    hls::{UriKind, reference},
    relay::{self, SEGMENT_CHUNK_SIZE, StreamTimeout},
    server::{state::AppState, url_validation::validate_source_url},
};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, header},
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// Relay a segment, or rewrite a variant playlist, for a session.
///
/// The reference decodes to the absolute upstream URL written into the
/// parent playlist. Variant playlists are rewritten under the same session
/// and cached under `<session>/<reference>`; everything else streams
/// through in 512 KiB chunks with the client's `Range` forwarded.
pub async fn serve_segment(
    Path((session_id, reference)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    let handler = if UriKind::of(&reference) == UriKind::Playlist {
        "variant"
    } else {
        "segment"
    };

    let result = async {
        let session = state.sessions.get(&session_id)?;
        state.sessions.touch(&session_id);

        let upstream_url = reference::decode(&reference)?;
        validate_source_url(&upstream_url, state.config.allow_private_upstreams)?;

        if UriKind::of(&upstream_url) == UriKind::Playlist {
            let cache_key = format!("{}/{}", session_id, reference);
            let entry = load_playlist(&state, &session, &cache_key, &upstream_url).await?;
            return Ok::<_, ProxyError>(relay::playlist_response(&entry));
        }

        info!("Relaying segment for session {}: {}", session_id, upstream_url);
        let upstream = relay::open_stream(
            &state.http_client,
            &session.upstream_headers,
            &upstream_url,
            headers.get(header::RANGE),
            StreamTimeout::Total(state.config.segment_timeout()),
        )
        .await?;

        Ok(upstream.into_response(segment_content_type(&upstream_url), SEGMENT_CHUNK_SIZE))
    }
    .await;

    finish(handler, start, result)
}

/// `video/mp2t` for transport stream segments; other containers (fMP4,
/// AAC, WebVTT) keep the upstream type.
fn segment_content_type(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase()
        .ends_with(".ts")
        .then(|| UriKind::Segment.content_type())
}
