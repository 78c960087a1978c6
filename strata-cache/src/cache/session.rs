//! Session-scoped tier
//!
//! In-memory store partitioned by session id. A session and each of its items
//! expire independently; capacity is bounded per session and globally.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::memory::{EvictionCallback, estimate_size};
use crate::core::key::matches_pattern;
use crate::core::{CacheEntry, DEFAULT_PRIORITY, SharedClock};

/// Configuration for the session tier
#[derive(Debug, Clone)]
pub struct SessionTierConfig {
    pub session_ttl: Duration,
    pub item_ttl: Duration,
    pub max_session_size: usize,
    pub max_total_size: usize,
}

impl Default for SessionTierConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(3600),
            item_ttl: Duration::from_secs(1800),
            max_session_size: 100,
            max_total_size: 10_000,
        }
    }
}

/// Public view of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub user_id: Option<String>,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub item_count: usize,
    pub expires_at: u64,
}

/// Result of a cleanup sweep
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SessionCleanup {
    pub sessions_removed: usize,
    pub items_removed: usize,
}

/// Statistics for the session tier
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionTierStats {
    pub active_sessions: usize,
    pub total_items: usize,
    pub max_session_size: usize,
    pub max_total_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_sessions: u64,
    pub expired_items: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_sessions: AtomicU64,
    expired_items: AtomicU64,
}

struct Session<V> {
    user_id: Option<String>,
    created_at: u64,
    last_activity_at: u64,
    expires_at: u64,
    ttl: Duration,
    items: HashMap<String, CacheEntry<V>>,
}

impl<V> Session<V> {
    fn new(user_id: Option<String>, now: u64, ttl: Duration) -> Self {
        Self {
            user_id,
            created_at: now,
            last_activity_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
            ttl,
            items: HashMap::new(),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    fn metadata(&self, session_id: &str, now: u64) -> SessionMetadata {
        SessionMetadata {
            session_id: session_id.to_string(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            item_count: self.items.values().filter(|i| !i.is_expired(now)).count(),
            expires_at: self.expires_at,
        }
    }

    fn least_recent_item(&self) -> Option<String> {
        self.items
            .iter()
            .min_by_key(|(_, item)| item.last_accessed_at)
            .map(|(k, _)| k.clone())
    }
}

struct Registry<V> {
    sessions: HashMap<String, Session<V>>,
    total_items: usize,
}

impl<V> Registry<V> {
    fn destroy(&mut self, session_id: &str) -> Option<Session<V>> {
        let session = self.sessions.remove(session_id)?;
        self.total_items = self.total_items.saturating_sub(session.items.len());
        Some(session)
    }

    fn remove_item(&mut self, session_id: &str, key: &str) -> Option<CacheEntry<V>> {
        let item = self.sessions.get_mut(session_id)?.items.remove(key)?;
        self.total_items = self.total_items.saturating_sub(1);
        Some(item)
    }

    fn global_least_recent(&self) -> Option<(String, String)> {
        self.sessions
            .iter()
            .flat_map(|(sid, s)| {
                s.items
                    .iter()
                    .map(move |(key, item)| (item.last_accessed_at, sid, key))
            })
            .min_by_key(|(at, _, _)| *at)
            .map(|(_, sid, key)| (sid.clone(), key.clone()))
    }

    /// Destroy the session if it has expired, reporting whether it did
    fn reap_if_expired(&mut self, session_id: &str, now: u64) -> bool {
        let expired = self
            .sessions
            .get(session_id)
            .is_some_and(|s| s.is_expired(now));
        if expired {
            self.destroy(session_id);
        }
        expired
    }
}

/// Session-partitioned cache tier
#[derive(Clone)]
pub struct SessionTier<V> {
    registry: Arc<Mutex<Registry<V>>>,
    counters: Arc<Counters>,
    config: SessionTierConfig,
    clock: SharedClock,
    on_evict: Option<EvictionCallback<V>>,
}

impl<V> SessionTier<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Create a new session tier
    pub fn new(config: SessionTierConfig, clock: SharedClock) -> Self {
        info!(
            "Initializing session tier with session_ttl={:?}, item_ttl={:?}, max_session_size={}, max_total_size={}",
            config.session_ttl, config.item_ttl, config.max_session_size, config.max_total_size
        );

        Self {
            registry: Arc::new(Mutex::new(Registry {
                sessions: HashMap::new(),
                total_items: 0,
            })),
            counters: Arc::new(Counters::default()),
            config,
            clock,
            on_evict: None,
        }
    }

    /// Register the eviction hook, called with `"<session>:<key>"`
    pub fn with_eviction_callback(mut self, callback: EvictionCallback<V>) -> Self {
        self.on_evict = Some(callback);
        self
    }

    pub fn config(&self) -> &SessionTierConfig {
        &self.config
    }

    /// Start background expiry sweep
    pub fn start_cleanup(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        info!("Starting session cleanup task (interval={:?})", interval);

        let tier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = tier.cleanup();
                if report.sessions_removed > 0 || report.items_removed > 0 {
                    debug!(
                        "Session cleanup removed {} sessions, {} items",
                        report.sessions_removed, report.items_removed
                    );
                }
            }
        })
    }

    /// Create a session, or renew it if it is already live
    pub fn create_session(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        ttl: Option<Duration>,
    ) -> SessionMetadata {
        let now = self.clock.now_millis();
        let ttl = ttl.unwrap_or(self.config.session_ttl);
        let mut registry = self.registry.lock();
        registry.reap_if_expired(session_id, now);

        let session = registry
            .sessions
            .entry(session_id.to_string())
            .and_modify(|s| {
                s.ttl = ttl;
                s.expires_at = now.saturating_add(ttl.as_millis() as u64);
                s.last_activity_at = now;
                if let Some(user) = user_id {
                    s.user_id = Some(user.to_string());
                }
            })
            .or_insert_with(|| {
                debug!("Session CREATE id={}", session_id);
                Session::new(user_id.map(str::to_string), now, ttl)
            });

        session.metadata(session_id, now)
    }

    /// Get an item, reaping the session or item if expired
    pub fn get(&self, session_id: &str, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut registry = self.registry.lock();

        if registry.reap_if_expired(session_id, now) {
            debug!("Session EXPIRED id={}", session_id);
            self.counters.expired_sessions.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let item_expired = match registry
            .sessions
            .get(session_id)
            .and_then(|s| s.items.get(key))
        {
            Some(item) => item.is_expired(now),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if item_expired {
            registry.remove_item(session_id, key);
            self.counters.expired_items.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Session item EXPIRED id={}, key={}", session_id, key);
            return None;
        }

        let session = registry.sessions.get_mut(session_id)?;
        session.last_activity_at = now;
        let item = session.items.get_mut(key)?;
        item.touch(now);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(item.data.clone())
    }

    /// Store an item, creating the session when missing
    pub fn set(&self, session_id: &str, key: &str, value: V, ttl: Option<Duration>) {
        let now = self.clock.now_millis();
        let ttl = ttl.unwrap_or(self.config.item_ttl);
        let size = estimate_size(&value);
        let mut evicted = Vec::new();

        {
            let mut registry = self.registry.lock();
            if registry.reap_if_expired(session_id, now) {
                self.counters.expired_sessions.fetch_add(1, Ordering::Relaxed);
            }
            let session_ttl = self.config.session_ttl;
            registry
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Session::new(None, now, session_ttl));

            let access_count = registry
                .remove_item(session_id, key)
                .map_or(0, |old| old.access_count);

            // Per-session budget
            loop {
                let Some(session) = registry.sessions.get(session_id) else {
                    break;
                };
                if session.items.len() < self.config.max_session_size {
                    break;
                }
                let Some(victim) = session.least_recent_item() else {
                    break;
                };
                if let Some(item) = registry.remove_item(session_id, &victim) {
                    evicted.push((format!("{}:{}", session_id, victim), item.data));
                }
            }

            // Global budget: same session first, then anywhere
            while registry.total_items >= self.config.max_total_size {
                let local = registry
                    .sessions
                    .get(session_id)
                    .and_then(|s| s.least_recent_item())
                    .map(|k| (session_id.to_string(), k));
                let Some((sid, victim)) = local.or_else(|| registry.global_least_recent()) else {
                    break;
                };
                if let Some(item) = registry.remove_item(&sid, &victim) {
                    evicted.push((format!("{}:{}", sid, victim), item.data));
                }
            }

            let mut entry = CacheEntry::new(value, now, ttl, DEFAULT_PRIORITY, size);
            entry.access_count = access_count;
            if let Some(session) = registry.sessions.get_mut(session_id) {
                session.items.insert(key.to_string(), entry);
                session.last_activity_at = now;
                registry.total_items += 1;
            }
        }

        debug!("Session SET id={}, key={}, ttl={:?}", session_id, key, ttl);

        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            for (composite, data) in &evicted {
                debug!("Session EVICT {}", composite);
                if let Some(callback) = &self.on_evict {
                    callback(composite, data);
                }
            }
        }
    }

    /// Delete an item
    pub fn delete(&self, session_id: &str, key: &str) -> bool {
        self.registry.lock().remove_item(session_id, key).is_some()
    }

    /// Check for a live item without counting an access
    pub fn has(&self, session_id: &str, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut registry = self.registry.lock();
        if registry.reap_if_expired(session_id, now) {
            self.counters.expired_sessions.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match registry
            .sessions
            .get(session_id)
            .and_then(|s| s.items.get(key))
        {
            Some(item) if item.is_expired(now) => {
                registry.remove_item(session_id, key);
                self.counters.expired_items.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Live item keys of a session, sorted
    pub fn get_session_keys(&self, session_id: &str) -> Vec<String> {
        let now = self.clock.now_millis();
        let registry = self.registry.lock();
        let mut keys: Vec<String> = registry
            .sessions
            .get(session_id)
            .filter(|s| !s.is_expired(now))
            .map(|s| {
                s.items
                    .iter()
                    .filter(|(_, item)| !item.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Snapshot of every live item in a session
    pub fn get_session_data(&self, session_id: &str) -> HashMap<String, V> {
        let now = self.clock.now_millis();
        let registry = self.registry.lock();
        registry
            .sessions
            .get(session_id)
            .filter(|s| !s.is_expired(now))
            .map(|s| {
                s.items
                    .iter()
                    .filter(|(_, item)| !item.is_expired(now))
                    .map(|(k, item)| (k.clone(), item.data.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Destroy a session together with its items
    pub fn clear_session(&self, session_id: &str) -> bool {
        let removed = self.registry.lock().destroy(session_id).is_some();
        if removed {
            debug!("Session CLEAR id={}", session_id);
        }
        removed
    }

    /// Push a live session's expiry further out
    pub fn extend_session(&self, session_id: &str, extra: Duration) -> bool {
        let now = self.clock.now_millis();
        let mut registry = self.registry.lock();
        if registry.reap_if_expired(session_id, now) {
            return false;
        }
        match registry.sessions.get_mut(session_id) {
            Some(session) => {
                session.expires_at = session
                    .expires_at
                    .saturating_add(extra.as_millis() as u64);
                session.last_activity_at = now;
                true
            }
            None => false,
        }
    }

    /// Restart a live session's lifetime from now
    pub fn renew_session(&self, session_id: &str) -> bool {
        let now = self.clock.now_millis();
        let mut registry = self.registry.lock();
        if registry.reap_if_expired(session_id, now) {
            return false;
        }
        match registry.sessions.get_mut(session_id) {
            Some(session) => {
                session.expires_at = now.saturating_add(session.ttl.as_millis() as u64);
                session.last_activity_at = now;
                true
            }
            None => false,
        }
    }

    /// Metadata of a live session
    pub fn get_session(&self, session_id: &str) -> Option<SessionMetadata> {
        let now = self.clock.now_millis();
        let registry = self.registry.lock();
        registry
            .sessions
            .get(session_id)
            .filter(|s| !s.is_expired(now))
            .map(|s| s.metadata(session_id, now))
    }

    /// Metadata of every live session, ordered by id
    pub fn get_active_sessions(&self) -> Vec<SessionMetadata> {
        let now = self.clock.now_millis();
        let registry = self.registry.lock();
        let mut sessions: Vec<SessionMetadata> = registry
            .sessions
            .iter()
            .filter(|(_, s)| !s.is_expired(now))
            .map(|(id, s)| s.metadata(id, now))
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Remove items whose key matches `pattern` across all sessions, or every
    /// session when no pattern is given
    pub fn clear_matching(&self, pattern: Option<&str>) -> usize {
        let mut registry = self.registry.lock();
        match pattern {
            None => {
                let count = registry.total_items;
                registry.sessions.clear();
                registry.total_items = 0;
                count
            }
            Some(pattern) => {
                let doomed: Vec<(String, String)> = registry
                    .sessions
                    .iter()
                    .flat_map(|(sid, s)| {
                        s.items
                            .keys()
                            .filter(move |k| matches_pattern(pattern, k))
                            .map(move |k| (sid.clone(), k.clone()))
                    })
                    .collect();
                for (sid, key) in &doomed {
                    registry.remove_item(sid, key);
                }
                doomed.len()
            }
        }
    }

    /// Remove expired sessions and expired items
    pub fn cleanup(&self) -> SessionCleanup {
        let now = self.clock.now_millis();
        let mut registry = self.registry.lock();
        let mut report = SessionCleanup::default();

        let expired_sessions: Vec<String> = registry
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired_sessions {
            if let Some(session) = registry.destroy(id) {
                report.sessions_removed += 1;
                report.items_removed += session.items.len();
            }
        }

        let expired_items: Vec<(String, String)> = registry
            .sessions
            .iter()
            .flat_map(|(sid, s)| {
                s.items
                    .iter()
                    .filter(move |(_, item)| item.is_expired(now))
                    .map(move |(k, _)| (sid.clone(), k.clone()))
            })
            .collect();
        for (sid, key) in &expired_items {
            if registry.remove_item(sid, key).is_some() {
                report.items_removed += 1;
            }
        }

        self.counters
            .expired_sessions
            .fetch_add(report.sessions_removed as u64, Ordering::Relaxed);
        self.counters
            .expired_items
            .fetch_add(expired_items.len() as u64, Ordering::Relaxed);
        report
    }

    /// Total items held across sessions
    pub fn total_items(&self) -> usize {
        self.registry.lock().total_items
    }

    /// Get statistics
    pub fn stats(&self) -> SessionTierStats {
        let now = self.clock.now_millis();
        let (active_sessions, total_items) = {
            let registry = self.registry.lock();
            (
                registry
                    .sessions
                    .values()
                    .filter(|s| !s.is_expired(now))
                    .count(),
                registry.total_items,
            )
        };

        SessionTierStats {
            active_sessions,
            total_items,
            max_session_size: self.config.max_session_size,
            max_total_size: self.config.max_total_size,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired_sessions: self.counters.expired_sessions.load(Ordering::Relaxed),
            expired_items: self.counters.expired_items.load(Ordering::Relaxed),
        }
    }
}
