use crate::{cache::PlaylistCache, config::Config, session::SessionManager};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling
    pub http_client: Client,
    /// Stream sessions and the active pointer
    pub sessions: SessionManager,
    /// Rewritten playlists, keyed by session (and variant reference)
    pub cache: PlaylistCache,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        // Per-request timeouts are set by the relay, not on the client
        let http_client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let sessions = SessionManager::with_overrides(config.session_idle(), config.header_overrides());
        let cache = PlaylistCache::with_ttl(config.playlist_cache_ttl());

        Ok(Self {
            config: Arc::new(config),
            http_client,
            sessions,
            cache,
            metrics: crate::metrics::install(),
            started_at: Instant::now(),
        })
    }

    /// Evict idle sessions together with their cached playlists, then sweep
    /// stale entries left behind by sessions that stay alive.
    pub fn cleanup_sessions(&self) -> Vec<String> {
        let evicted = self.sessions.cleanup_expired();
        for id in &evicted {
            self.cache.invalidate_session(id);
        }
        self.cache.sweep();
        crate::metrics::set_active_sessions(self.sessions.session_count());
        evicted
    }
}
