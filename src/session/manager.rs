use super::profile::{ClientProfile, HeaderOverrides, upstream_headers};
use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::info;
use url::Url;
use uuid::Uuid;

/// Isolated per-stream state.
///
/// Everything a segment request needs to reach the right upstream lives
/// here, so two streams playing at once never resolve against each other.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    /// Playlist URL exactly as the client supplied it
    pub source_url: String,
    /// Source URL without query or fragment
    pub base_url: String,
    /// Entire source query string, re-attached to token-less segment URLs
    pub token: Option<String>,
    pub profile: ClientProfile,
    /// Headers sent on every upstream request for this session
    pub upstream_headers: HeaderMap,
    pub created_at: SystemTime,
    pub last_accessed: SystemTime,
    /// Last successful playlist refresh
    pub refreshed_at: Option<SystemTime>,
}

impl Session {
    fn new(source_url: &str, profile: ClientProfile, overrides: &HeaderOverrides) -> Result<Self> {
        let mut base = Url::parse(source_url)
            .map_err(|e| ProxyError::InvalidSource(format!("{}: {}", source_url, e)))?;
        let token = base
            .query()
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        base.set_query(None);
        base.set_fragment(None);

        let now = SystemTime::now();
        Ok(Self {
            session_id: new_session_id(),
            source_url: source_url.to_string(),
            base_url: base.into(),
            token,
            profile,
            upstream_headers: upstream_headers(profile, source_url, overrides),
            created_at: now,
            last_accessed: now,
            refreshed_at: None,
        })
    }
}

fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

fn source_key(source_url: &str, profile: ClientProfile) -> String {
    format!("{}|{}", profile.as_str(), source_url)
}

/// Registry of stream sessions plus the single active-stream pointer.
///
/// Invariant: at most one session is active. Switching the pointer never
/// touches other sessions' base URL or token; superseded sessions stay
/// addressable until they sit idle past the TTL.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Session>>,
    /// (profile, source URL) -> session id
    by_source: Arc<DashMap<String, String>>,
    active: Arc<RwLock<Option<String>>>,
    overrides: HeaderOverrides,
    ttl: Duration,
}

impl SessionManager {
    /// Create an in-memory registry evicting sessions idle for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self::with_overrides(ttl, HeaderOverrides::default())
    }

    pub fn with_overrides(ttl: Duration, overrides: HeaderOverrides) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            by_source: Arc::new(DashMap::new()),
            active: Arc::new(RwLock::new(None)),
            overrides,
            ttl,
        }
    }

    /// Return the session for `source_url`, creating it on first use.
    ///
    /// Idempotent per (source, profile), including under concurrent first
    /// requests: only the caller holding the index entry may register a
    /// session, the others adopt its id.
    pub fn get_or_create(&self, source_url: &str, profile: ClientProfile) -> Result<Session> {
        let key = source_key(source_url, profile);

        let existing = self.by_source.get(&key).map(|id| id.clone());
        if let Some(id) = existing
            && let Some(session) = self.sessions.get(&id)
        {
            return Ok(session.clone());
        }

        // Validates the source before the index is touched
        let candidate = Session::new(source_url, profile, &self.overrides)?;

        let (session_id, created) = {
            let mut slot = self.by_source.entry(key).or_default();
            if slot.is_empty() || !self.sessions.contains_key(slot.as_str()) {
                *slot = candidate.session_id.clone();
                self.sessions
                    .insert(candidate.session_id.clone(), candidate.clone());
                (slot.clone(), true)
            } else {
                (slot.clone(), false)
            }
        };

        if created {
            info!(
                "Created session {} ({}) for {}",
                session_id,
                profile.as_str(),
                source_url
            );
            return Ok(candidate);
        }

        self.get(&session_id)
    }

    /// Fetch a session snapshot by id.
    ///
    /// # Errors
    /// [`ProxyError::SessionNotFound`] for unknown or evicted ids.
    pub fn get(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| ProxyError::SessionNotFound(session_id.to_string()))
    }

    /// Make `session_id` the authoritative stream.
    pub fn set_active(&self, session_id: &str) -> Result<()> {
        if !self.sessions.contains_key(session_id) {
            return Err(ProxyError::SessionNotFound(session_id.to_string()));
        }
        let mut active = self.active.write().unwrap_or_else(|p| p.into_inner());
        if active.as_deref() != Some(session_id) {
            info!("Active stream -> {}", session_id);
            *active = Some(session_id.to_string());
        }
        Ok(())
    }

    pub fn active_id(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Snapshot of the active session, if one is set and still registered.
    pub fn active(&self) -> Option<Session> {
        let id = self.active_id()?;
        self.get(&id).ok()
    }

    /// Update last accessed time for a session
    pub fn touch(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_accessed = SystemTime::now();
        }
    }

    /// Record a successful playlist refresh.
    pub fn mark_refreshed(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            let now = SystemTime::now();
            session.refreshed_at = Some(now);
            session.last_accessed = now;
        }
    }

    /// Replace the session serving `source_url` with a fresh one.
    ///
    /// Used when a refresh finds the cache expired and the upstream
    /// unreachable. The old session is removed, and the active pointer moves
    /// to the replacement if it pointed at the old one.
    pub fn recreate(&self, source_url: &str, profile: ClientProfile) -> Result<Session> {
        let fresh = Session::new(source_url, profile, &self.overrides)?;
        self.sessions
            .insert(fresh.session_id.clone(), fresh.clone());

        let previous = self
            .by_source
            .insert(source_key(source_url, profile), fresh.session_id.clone());

        if let Some(old_id) = previous {
            self.sessions.remove(&old_id);
            let mut active = self.active.write().unwrap_or_else(|p| p.into_inner());
            if active.as_deref() == Some(old_id.as_str()) {
                *active = Some(fresh.session_id.clone());
            }
            info!(
                "Recreated session {} -> {} for {}",
                old_id, fresh.session_id, source_url
            );
        }

        Ok(fresh)
    }

    /// Remove sessions idle for longer than the TTL and return their ids.
    ///
    /// The active session is never evicted.
    pub fn cleanup_expired(&self) -> Vec<String> {
        let active = self.active_id();
        let now = SystemTime::now();
        let mut evicted = Vec::new();

        self.sessions.retain(|id, session| {
            if active.as_deref() == Some(id.as_str()) {
                return true;
            }
            let keep = match now.duration_since(session.last_accessed) {
                Ok(elapsed) => elapsed < self.ttl,
                Err(_) => true,
            };
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });

        if !evicted.is_empty() {
            self.by_source.retain(|_, id| !evicted.contains(id));
            info!("Evicted {} idle sessions", evicted.len());
        }

        evicted
    }

    /// Remove a specific session
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(session_id).map(|(_, s)| s)?;
        self.by_source
            .remove_if(&source_key(&removed.source_url, removed.profile), |_, id| {
                id == session_id
            });
        let mut active = self.active.write().unwrap_or_else(|p| p.into_inner());
        if active.as_deref() == Some(session_id) {
            *active = None;
        }
        Some(removed)
    }

    /// Get the count of registered sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE_A: &str = "https://a.example.com/live/a.m3u8?tok=aaa";
    const SOURCE_B: &str = "https://b.example.com/hls/b.m3u8?tok=bbb";

    fn manager() -> SessionManager {
        SessionManager::new(Duration::from_secs(300))
    }

    #[test]
    fn session_creation_splits_base_and_token() {
        let manager = manager();
        let session = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();

        assert_eq!(session.source_url, SOURCE_A);
        assert_eq!(session.base_url, "https://a.example.com/live/a.m3u8");
        assert_eq!(session.token.as_deref(), Some("tok=aaa"));
        assert_eq!(session.session_id.len(), 16);
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn get_or_create_is_idempotent_per_source() {
        let manager = manager();
        let first = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();
        let second = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();

        assert_eq!(first.session_id, second.session_id);
        assert_eq!(manager.session_count(), 1);

        // A different profile is a different upstream identity
        let mx = manager.get_or_create(SOURCE_A, ClientProfile::MxPlayer).unwrap();
        assert_ne!(mx.session_id, first.session_id);
        assert_eq!(manager.session_count(), 2);
    }

    #[test]
    fn concurrent_first_requests_share_one_session() {
        let manager = manager();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    manager
                        .get_or_create(SOURCE_A, ClientProfile::Browser)
                        .unwrap()
                        .session_id
                })
            })
            .collect();

        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn invalid_source_is_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.get_or_create("not a url", ClientProfile::Browser),
            Err(ProxyError::InvalidSource(_))
        ));
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn get_nonexistent_is_session_not_found() {
        let manager = manager();
        assert!(matches!(
            manager.get("no-such-session"),
            Err(ProxyError::SessionNotFound(_))
        ));
        assert!(manager.set_active("no-such-session").is_err());
    }

    #[test]
    fn switching_active_keeps_previous_session_intact() {
        let manager = manager();
        let a = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();
        manager.set_active(&a.session_id).unwrap();

        let b = manager.get_or_create(SOURCE_B, ClientProfile::Browser).unwrap();
        manager.set_active(&b.session_id).unwrap();

        assert_eq!(manager.active_id().as_deref(), Some(b.session_id.as_str()));

        let a_after = manager.get(&a.session_id).unwrap();
        assert_eq!(a_after.base_url, "https://a.example.com/live/a.m3u8");
        assert_eq!(a_after.token.as_deref(), Some("tok=aaa"));
        assert_eq!(a_after.source_url, a.source_url);
    }

    #[test]
    fn touch_updates_last_accessed() {
        let manager = manager();
        let session = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        manager.touch(&session.session_id);

        let updated = manager.get(&session.session_id).unwrap();
        assert!(updated.last_accessed > session.last_accessed);
    }

    #[test]
    fn cleanup_expired_spares_the_active_session() {
        let manager = SessionManager::new(Duration::from_millis(1));
        let a = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();
        let b = manager.get_or_create(SOURCE_B, ClientProfile::Browser).unwrap();
        manager.set_active(&b.session_id).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let evicted = manager.cleanup_expired();

        assert_eq!(evicted, vec![a.session_id.clone()]);
        assert!(manager.get(&a.session_id).is_err());
        assert!(manager.get(&b.session_id).is_ok());

        // The evicted source gets a brand-new session next time
        let a2 = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();
        assert_ne!(a2.session_id, a.session_id);
    }

    #[test]
    fn recreate_replaces_session_and_moves_active_pointer() {
        let manager = manager();
        let old = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();
        manager.set_active(&old.session_id).unwrap();

        let fresh = manager.recreate(SOURCE_A, ClientProfile::Browser).unwrap();

        assert_ne!(fresh.session_id, old.session_id);
        assert!(manager.get(&old.session_id).is_err());
        assert_eq!(manager.active_id(), Some(fresh.session_id.clone()));
        assert_eq!(
            manager
                .get_or_create(SOURCE_A, ClientProfile::Browser)
                .unwrap()
                .session_id,
            fresh.session_id
        );
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn remove_clears_index_and_active_pointer() {
        let manager = manager();
        let session = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();
        manager.set_active(&session.session_id).unwrap();

        assert!(manager.remove(&session.session_id).is_some());
        assert_eq!(manager.session_count(), 0);
        assert!(manager.active().is_none());
        assert!(manager.remove(&session.session_id).is_none());
    }

    #[test]
    fn mark_refreshed_records_timestamp() {
        let manager = manager();
        let session = manager.get_or_create(SOURCE_A, ClientProfile::Browser).unwrap();
        assert!(session.refreshed_at.is_none());

        manager.mark_refreshed(&session.session_id);
        assert!(manager.get(&session.session_id).unwrap().refreshed_at.is_some());
    }
}
