//! Prometheus metrics.
//!
//! Recording goes through the `metrics` facade; the exporter is installed
//! once per process and rendered at `GET /metrics`.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder, or return the one already installed.
///
/// `None` when another recorder owns the global slot.
pub fn install() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .clone()
}

/// Count a served request by handler and status code.
pub fn record_request(handler: &'static str, status: u16) {
    counter!("hlsrelay_requests_total", "handler" => handler, "status" => status.to_string())
        .increment(1);
}

/// Observe request duration since `start`.
pub fn record_duration(handler: &'static str, start: Instant) {
    histogram!("hlsrelay_request_duration_seconds", "handler" => handler)
        .record(start.elapsed().as_secs_f64());
}

/// Count a failed upstream fetch by error kind.
pub fn record_upstream_error(kind: &'static str) {
    counter!("hlsrelay_upstream_errors_total", "kind" => kind).increment(1);
}

/// Count a playlist cache lookup.
pub fn record_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("hlsrelay_playlist_cache_total", "result" => result).increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!("hlsrelay_active_sessions").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent_and_renders_recorded_series() {
        let first = install();
        let second = install();
        assert_eq!(first.is_some(), second.is_some());

        let Some(handle) = first else { return };
        record_request("playlist", 200);
        record_cache(true);
        set_active_sessions(2);

        let rendered = handle.render();
        assert!(rendered.contains("hlsrelay_requests_total"));
        assert!(rendered.contains("hlsrelay_playlist_cache_total"));
        assert!(rendered.contains("hlsrelay_active_sessions"));
    }
}
