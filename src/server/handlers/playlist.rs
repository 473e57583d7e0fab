use super::{finish, source_param};
use crate::{
    cache::CachedPlaylist,
    error::{ProxyError, Result},
    hls::{UrlResolver, rewriter},
    metrics, relay,
    server::{state::AppState, url_validation::validate_source_url},
    session::{ClientProfile, Session},
};
use axum::{
    extract::{RawQuery, State},
    response::Response,
};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Serve the rewritten playlist for `?url=`, or for the active stream.
///
/// With `url`, the browser-profile session for that source is created or
/// reused and becomes the active stream.
pub async fn serve_playlist(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let start = Instant::now();
    let result = async {
        let session = match source_param(query.as_deref()) {
            Some(url) => activate(&state, &url, ClientProfile::Browser)?,
            None => active_session(&state)?,
        };
        let entry = serve_session_playlist(&state, &session).await?;
        Ok::<_, ProxyError>(relay::playlist_response(&entry))
    }
    .await;
    finish("playlist", start, result)
}

/// Validate `url`, get or create its session and make it the active stream.
pub(crate) fn activate(state: &AppState, url: &str, profile: ClientProfile) -> Result<Session> {
    validate_source_url(url, state.config.allow_private_upstreams)?;
    let session = state.sessions.get_or_create(url, profile)?;
    state.sessions.set_active(&session.session_id)?;
    metrics::set_active_sessions(state.sessions.session_count());
    Ok(session)
}

/// The active session, or a client error when no stream was selected.
pub(crate) fn active_session(state: &AppState) -> Result<Session> {
    state.sessions.active().ok_or_else(|| {
        ProxyError::InvalidSource("no url given and no active stream selected".to_string())
    })
}

/// Serve a session's root playlist.
///
/// When the cached copy has expired and the upstream turns out to be
/// unreachable, the session is recreated so the next poll starts clean.
pub(crate) async fn serve_session_playlist(
    state: &AppState,
    session: &Session,
) -> Result<CachedPlaylist> {
    state.sessions.touch(&session.session_id);

    match load_playlist(state, session, &session.session_id, &session.source_url).await {
        Err(e) if e.is_unreachable() => {
            // Skip if a concurrent request already replaced it
            if state.sessions.get(&session.session_id).is_ok() {
                let fresh = state.sessions.recreate(&session.source_url, session.profile)?;
                state.cache.invalidate_session(&session.session_id);
                warn!(
                    "Upstream unreachable for session {}, recreated as {}",
                    session.session_id, fresh.session_id
                );
            }
            Err(e)
        }
        other => other,
    }
}

/// Read-through load of a rewritten playlist.
///
/// A miss takes the per-key fill lock and re-checks before fetching, so
/// concurrent misses for one key cost one upstream request. Failed fetches
/// leave the cache untouched.
pub(crate) async fn load_playlist(
    state: &AppState,
    session: &Session,
    cache_key: &str,
    upstream_url: &str,
) -> Result<CachedPlaylist> {
    if let Some(hit) = state.cache.get_fresh(cache_key) {
        metrics::record_cache(true);
        return Ok(hit);
    }

    let lock = state.cache.fill_lock(cache_key);
    let _fill = lock.lock().await;

    if let Some(hit) = state.cache.get_fresh(cache_key) {
        debug!("Playlist {} filled while waiting", cache_key);
        metrics::record_cache(true);
        return Ok(hit);
    }
    metrics::record_cache(false);

    info!(
        "Fetching playlist for session {}: {}",
        session.session_id, upstream_url
    );
    let fetched = relay::fetch_playlist(
        &state.http_client,
        &session.upstream_headers,
        upstream_url,
        state.config.playlist_timeout(),
    )
    .await?;

    // Relative references resolve against the post-redirect URL
    let resolver = UrlResolver::from_playlist_url(&fetched.final_url)?
        .with_fallback_token(session.token.as_deref());
    let rewritten = rewriter::rewrite(
        &session.session_id,
        &resolver,
        &fetched.text,
        state.config.proxy_base(),
    );
    if rewritten.malformed {
        metrics::record_upstream_error("malformed_playlist");
    }

    let entry = state
        .cache
        .put(cache_key, rewritten.body, state.cache.ttl());
    state.sessions.mark_refreshed(&session.session_id);
    Ok(entry)
}
