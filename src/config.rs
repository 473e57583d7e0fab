use crate::session::HeaderOverrides;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    /// Prefix for proxy URIs written into playlists; root-relative when unset
    pub public_base_url: Option<String>,
    /// Playlist cache TTL in seconds (default: 30)
    pub playlist_cache_ttl_secs: u64,
    /// Idle time before an inactive session is evicted (default: 3600)
    pub session_idle_secs: u64,
    /// Interval of the session cleanup task (default: 300)
    pub cleanup_interval_secs: u64,
    /// Upstream playlist fetch timeout (default: 15)
    pub playlist_timeout_secs: u64,
    /// Upstream segment transfer timeout (default: 20)
    pub segment_timeout_secs: u64,
    /// Accept upstreams on loopback/private networks
    pub allow_private_upstreams: bool,
    pub upstream_user_agent: Option<String>,
    pub upstream_referer: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT is required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 3000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let public_base_url = match env::var("PUBLIC_BASE_URL") {
            Ok(raw) if !raw.trim().is_empty() => {
                let parsed = url::Url::parse(raw.trim())
                    .map_err(|e| format!("PUBLIC_BASE_URL is not a valid URL: {}", e))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err("PUBLIC_BASE_URL must be http or https".into());
                }
                Some(raw.trim().trim_end_matches('/').to_string())
            }
            _ => None,
        };

        let playlist_cache_ttl_secs = secs_var("PLAYLIST_CACHE_TTL_SECS", 30);
        let session_idle_secs = secs_var("SESSION_IDLE_SECS", 3600);
        let cleanup_interval_secs = secs_var("CLEANUP_INTERVAL_SECS", 300).max(1);
        let playlist_timeout_secs = secs_var("PLAYLIST_TIMEOUT_SECS", 15).max(1);
        let segment_timeout_secs = secs_var("SEGMENT_TIMEOUT_SECS", 20).max(1);

        // Private upstreams: open in dev, closed in prod unless opted in
        let allow_private_upstreams = env::var("ALLOW_PRIVATE_UPSTREAMS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(is_dev);

        let upstream_user_agent = non_empty_var("UPSTREAM_USER_AGENT");
        let upstream_referer = non_empty_var("UPSTREAM_REFERER");

        Ok(Config {
            port,
            is_dev,
            public_base_url,
            playlist_cache_ttl_secs,
            session_idle_secs,
            cleanup_interval_secs,
            playlist_timeout_secs,
            segment_timeout_secs,
            allow_private_upstreams,
            upstream_user_agent,
            upstream_referer,
        })
    }

    /// Dev defaults without touching the environment.
    pub fn dev() -> Self {
        Config {
            port: 3000,
            is_dev: true,
            public_base_url: None,
            playlist_cache_ttl_secs: 30,
            session_idle_secs: 3600,
            cleanup_interval_secs: 300,
            playlist_timeout_secs: 15,
            segment_timeout_secs: 20,
            allow_private_upstreams: true,
            upstream_user_agent: None,
            upstream_referer: None,
        }
    }

    pub fn playlist_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.playlist_cache_ttl_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn playlist_timeout(&self) -> Duration {
        Duration::from_secs(self.playlist_timeout_secs)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs)
    }

    pub fn header_overrides(&self) -> HeaderOverrides {
        HeaderOverrides {
            user_agent: self.upstream_user_agent.clone(),
            referer: self.upstream_referer.clone(),
        }
    }

    /// Prefix written in front of `/segment/...` proxy URIs.
    pub fn proxy_base(&self) -> &str {
        self.public_base_url.as_deref().unwrap_or("")
    }
}

fn secs_var(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
