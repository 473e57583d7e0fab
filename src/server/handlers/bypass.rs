use super::playlist::active_session;
use crate::{
    error::{ProxyError, Result},
    hls::rewriter,
    relay,
    server::state::AppState,
};
use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;

/// Characters of upstream body echoed back in the report
const PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BypassStatus {
    /// Upstream accepted the headers and answered 2xx
    Success,
    /// Upstream answered with a non-2xx status
    Failed,
    /// Upstream could not be reached
    Error,
}

/// What the upstream made of the active session's headers.
#[derive(Debug, Serialize, Deserialize)]
pub struct BypassReport {
    pub bypass_status: BypassStatus,
    pub session_id: String,
    pub source_url: String,
    pub profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    /// `master`, `media`, or the reason the body is not a playlist
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub headers_used: BTreeMap<String, String>,
    pub elapsed_ms: u64,
}

/// Fetch the active source with its session headers and report the outcome.
///
/// Nothing is cached or rewritten. Upstream failures are part of the report,
/// so only a missing active stream is an error response.
pub async fn test_bypass(State(state): State<AppState>) -> Response {
    let session = match active_session(&state) {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };
    info!(
        "Testing upstream headers for session {}: {}",
        session.session_id, session.source_url
    );

    let start = Instant::now();
    let fetched = relay::fetch_playlist(
        &state.http_client,
        &session.upstream_headers,
        &session.source_url,
        state.config.playlist_timeout(),
    )
    .await;

    let headers_used = session
        .upstream_headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect();

    let mut report = BypassReport {
        bypass_status: BypassStatus::Success,
        session_id: session.session_id,
        source_url: session.source_url,
        profile: session.profile.as_str().to_string(),
        http_status: None,
        final_url: None,
        content_length: None,
        content_preview: None,
        playlist: None,
        error: None,
        headers_used,
        elapsed_ms: 0,
    };
    apply_outcome(&mut report, fetched);
    report.elapsed_ms = start.elapsed().as_millis() as u64;

    Json(report).into_response()
}

fn apply_outcome(report: &mut BypassReport, fetched: Result<relay::FetchedPlaylist>) {
    match fetched {
        Ok(playlist) => {
            report.http_status = Some(200);
            report.content_length = Some(playlist.text.len());
            report.content_preview = Some(playlist.text.chars().take(PREVIEW_CHARS).collect());
            report.playlist = Some(match rewriter::validate(&playlist.text) {
                Ok(kind) => kind.as_str().to_string(),
                Err(e) => e.to_string(),
            });
            report.final_url = Some(playlist.final_url);
        }
        Err(ProxyError::UpstreamError { status, .. }) => {
            report.bypass_status = BypassStatus::Failed;
            report.http_status = Some(status);
            report.error = Some(format!("upstream answered {}", status));
        }
        Err(e) => {
            report.bypass_status = BypassStatus::Error;
            report.error = Some(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_report() -> BypassReport {
        BypassReport {
            bypass_status: BypassStatus::Success,
            session_id: "s".into(),
            source_url: "https://cdn.example.com/live.m3u8".into(),
            profile: "browser".into(),
            http_status: None,
            final_url: None,
            content_length: None,
            content_preview: None,
            playlist: None,
            error: None,
            headers_used: BTreeMap::new(),
            elapsed_ms: 0,
        }
    }

    #[test]
    fn preview_is_truncated_on_char_boundary() {
        let mut report = empty_report();
        let text = format!("#EXTM3U\n{}", "é".repeat(1000));
        apply_outcome(
            &mut report,
            Ok(relay::FetchedPlaylist {
                text: text.clone(),
                final_url: "https://cdn.example.com/live.m3u8".into(),
            }),
        );
        assert_eq!(report.bypass_status, BypassStatus::Success);
        assert_eq!(report.content_length, Some(text.len()));
        assert_eq!(report.content_preview.unwrap().chars().count(), PREVIEW_CHARS);
    }

    #[test]
    fn upstream_status_is_failed() {
        let mut report = empty_report();
        apply_outcome(
            &mut report,
            Err(ProxyError::UpstreamError {
                url: "https://cdn.example.com/live.m3u8".into(),
                status: 403,
            }),
        );
        assert_eq!(report.bypass_status, BypassStatus::Failed);
        assert_eq!(report.http_status, Some(403));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["bypass_status"], "FAILED");
        assert!(json.get("content_preview").is_none());
    }
}
