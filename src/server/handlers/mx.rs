use super::{
    finish,
    playlist::{activate, active_session, serve_session_playlist},
    source_param,
    stream::{direct_video, is_playlist_source},
};
use crate::{
    error::ProxyError,
    relay,
    server::state::AppState,
    session::ClientProfile,
};
use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use std::time::Instant;

/// MX Player tuned endpoint.
///
/// Same relay as `/stream`, but always with the MX profile, and playlists
/// are marked `no-cache` and `inline`. Without `url` the active stream is
/// replayed through an MX-profile session for the same source; the active
/// pointer is left where it is.
pub async fn serve_mx(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    let range = headers.get(header::RANGE);

    let result = async {
        let session = match source_param(query.as_deref()) {
            Some(url) if !is_playlist_source(&url) => {
                return direct_video(&state, &url, ClientProfile::MxPlayer, range).await;
            }
            Some(url) => activate(&state, &url, ClientProfile::MxPlayer)?,
            None => {
                let active = active_session(&state)?;
                state
                    .sessions
                    .get_or_create(&active.source_url, ClientProfile::MxPlayer)?
            }
        };

        let entry = serve_session_playlist(&state, &session).await?;
        let mut response = relay::playlist_response(&entry);
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_static("inline"));
        Ok::<_, ProxyError>(response)
    }
    .await;

    finish("mx", start, result)
}
