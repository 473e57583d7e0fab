//! Short-TTL cache for rewritten playlists.
//!
//! HLS players re-poll live playlists every few seconds. Entries live for the
//! configured TTL (30 seconds by default) and are read-through: a miss is
//! filled synchronously under a per-key async lock, so concurrent misses for
//! the same playlist cost exactly one upstream fetch.
//!
//! Keys are the session id for a session's root playlist and
//! `<session id>/<reference>` for variant playlists served under it.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Default TTL for cached playlists.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// A cached, already rewritten playlist.
#[derive(Clone, Debug)]
pub struct CachedPlaylist {
    pub body: Arc<str>,
    /// Monotonic stamp, bumped on every fill
    pub generation: u64,
    pub fetched_at: Instant,
    pub expires_at: Instant,
}

impl CachedPlaylist {
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }

    /// Time left before the entry goes stale.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Thread-safe playlist cache with TTL-based invalidation.
#[derive(Clone, Debug)]
pub struct PlaylistCache {
    entries: Arc<DashMap<String, CachedPlaylist>>,
    fill_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    generation: Arc<AtomicU64>,
    ttl: Duration,
}

impl PlaylistCache {
    /// Create a cache with the default 30-second TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            fill_locks: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the entry for `key` if it is still within its TTL.
    pub fn get_fresh(&self, key: &str) -> Option<CachedPlaylist> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_fresh() {
                debug!("Playlist cache HIT for {}", key);
                return Some(entry.clone());
            }
            // Stale: drop the read guard before removing
            drop(entry);
            self.entries
                .remove_if(key, |_, entry| !entry.is_fresh());
        }
        debug!("Playlist cache MISS for {}", key);
        None
    }

    /// Store a rewritten body for `key`, valid for `ttl`.
    ///
    /// An entry fetched later than this one is never overwritten.
    pub fn put(&self, key: &str, body: impl Into<Arc<str>>, ttl: Duration) -> CachedPlaylist {
        let now = Instant::now();
        let candidate = CachedPlaylist {
            body: body.into(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            fetched_at: now,
            expires_at: now + ttl,
        };

        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| candidate.clone());
        if slot.fetched_at <= candidate.fetched_at {
            *slot = candidate;
        }
        slot.clone()
    }

    /// Per-key lock serializing fills of one playlist.
    ///
    /// Hold it across fetch + rewrite + [`put`](Self::put), and re-check
    /// [`get_fresh`](Self::get_fresh) once acquired.
    pub fn fill_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.fill_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop every entry (root and variants) belonging to `session_id`.
    pub fn invalidate_session(&self, session_id: &str) {
        let variant_prefix = format!("{}/", session_id);
        let belongs = |key: &String| key == session_id || key.starts_with(&variant_prefix);
        self.entries.retain(|key, _| !belongs(key));
        self.fill_locks.retain(|key, _| !belongs(key));
    }

    /// Drop stale entries and fill locks nobody holds.
    ///
    /// Keys that are never read again (variant URLs re-signed on every master
    /// refresh) would otherwise stay forever for a session that is never
    /// evicted. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh());
        self.fill_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Swept {} stale playlist(s) from cache", removed);
        }
        removed
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PlaylistCache {
    fn default() -> Self {
        Self::new()
    }
}
