//! Tier orchestration
//!
//! Reads walk the configured waterfall and stop at the first hit. A hit warms
//! every faster tier: in-process tiers inline, remote tiers on a detached
//! task. Writes fan out to every usable tier, either awaited (write-through)
//! or in the background. A remote tier that fails is skipped until a health
//! probe brings it back.
//!
//! Session-scoped values live only in the session tier, so the memory and
//! remote tiers never hold data belonging to one session.

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::memory::{MemoryTier, MemoryTierConfig};
use super::remote::{RemoteStore, RemoteTier};
use super::session::{SessionCleanup, SessionTier, SessionTierConfig};
use crate::core::{CacheError, CacheOptions, Result, SetOptions, SharedClock, TierKind, TierStatus};
use crate::metrics::MetricsCollector;

/// Configuration for the tier orchestrator
#[derive(Debug, Clone)]
pub struct TieredCacheConfig {
    pub memory: MemoryTierConfig,
    pub session: SessionTierConfig,
    /// Read waterfall; must contain the memory tier exactly once
    pub tier_order: Vec<TierKind>,
    /// Await remote writes before `set` returns
    pub write_through: bool,
    /// TTL applied to remote writes when the caller gives none
    pub remote_ttl: Duration,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryTierConfig::default(),
            session: SessionTierConfig::default(),
            tier_order: TierKind::ALL.to_vec(),
            write_through: false,
            remote_ttl: Duration::from_secs(3600),
        }
    }
}

/// Check a read order for duplicates and a missing memory tier
pub fn validate_tier_order(order: &[TierKind]) -> Result<()> {
    let mut seen = HashSet::new();
    for kind in order {
        if !seen.insert(*kind) {
            return Err(CacheError::InvalidConfig(format!(
                "tier '{}' listed twice in tier_order",
                kind
            )));
        }
    }
    if !seen.contains(&TierKind::Memory) {
        return Err(CacheError::InvalidConfig(
            "tier_order must include the memory tier".to_string(),
        ));
    }
    Ok(())
}

/// Multi-tier cache over JSON values
#[derive(Clone)]
pub struct TieredCache {
    memory: MemoryTier<Value>,
    sessions: SessionTier<Value>,
    primary: Option<RemoteTier>,
    secondary: Option<RemoteTier>,
    disabled: Arc<RwLock<HashSet<TierKind>>>,
    metrics: Arc<MetricsCollector>,
    config: TieredCacheConfig,
}

impl TieredCache {
    pub fn new(
        config: TieredCacheConfig,
        clock: SharedClock,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        validate_tier_order(&config.tier_order)?;
        info!(
            "Initializing tiered cache with order={:?}, write_through={}",
            config.tier_order, config.write_through
        );

        let memory_metrics = metrics.clone();
        let memory = MemoryTier::new(config.memory.clone(), clock.clone()).with_eviction_callback(
            Arc::new(move |_key: &str, _value: &Value| {
                memory_metrics.record_eviction(TierKind::Memory)
            }),
        );

        let session_metrics = metrics.clone();
        let sessions = SessionTier::new(config.session.clone(), clock).with_eviction_callback(
            Arc::new(move |_key: &str, _value: &Value| {
                session_metrics.record_eviction(TierKind::Session)
            }),
        );

        let cache = Self {
            memory,
            sessions,
            primary: None,
            secondary: None,
            disabled: Arc::new(RwLock::new(HashSet::new())),
            metrics,
            config,
        };
        cache.refresh_metrics();
        Ok(cache)
    }

    /// Attach a remote store to one of the remote slots
    pub fn with_remote(mut self, kind: TierKind, store: Arc<dyn RemoteStore>) -> Result<Self> {
        let tier = RemoteTier::new(kind, store, self.config.remote_ttl);
        match kind {
            TierKind::RemotePrimary => self.primary = Some(tier),
            TierKind::RemoteSecondary => self.secondary = Some(tier),
            other => {
                return Err(CacheError::InvalidConfig(format!(
                    "'{}' is not a remote tier",
                    other
                )));
            }
        }
        self.refresh_metrics();
        Ok(self)
    }

    pub fn config(&self) -> &TieredCacheConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryTier<Value> {
        &self.memory
    }

    pub fn sessions(&self) -> &SessionTier<Value> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn remote(&self, kind: TierKind) -> Option<&RemoteTier> {
        match kind {
            TierKind::RemotePrimary => self.primary.as_ref(),
            TierKind::RemoteSecondary => self.secondary.as_ref(),
            _ => None,
        }
    }

    fn remotes(&self) -> impl Iterator<Item = &RemoteTier> {
        self.primary.iter().chain(self.secondary.iter())
    }

    fn is_enabled(&self, kind: TierKind) -> bool {
        !self.disabled.read().contains(&kind)
    }

    /// Whether `kind` takes part in an operation
    fn is_usable(&self, kind: TierKind, scoped: bool) -> bool {
        if !self.is_enabled(kind) {
            return false;
        }
        match kind {
            TierKind::Memory => true,
            TierKind::Session => scoped,
            remote => self.remote(remote).is_some_and(|t| t.is_healthy()),
        }
    }

    fn usable_remotes(&self) -> Vec<RemoteTier> {
        self.remotes()
            .filter(|t| self.is_usable(t.kind(), false))
            .cloned()
            .collect()
    }

    /// Enable or forcibly disable a tier; the memory tier cannot be disabled
    pub fn set_tier_enabled(&self, kind: TierKind, enabled: bool) -> Result<()> {
        if kind == TierKind::Memory && !enabled {
            return Err(CacheError::InvalidConfig(
                "the memory tier cannot be disabled".to_string(),
            ));
        }

        {
            let mut disabled = self.disabled.write();
            if enabled {
                disabled.remove(&kind);
            } else {
                disabled.insert(kind);
            }
        }
        info!("Tier {} enabled={}", kind, enabled);
        self.refresh_metrics();
        Ok(())
    }

    pub fn tier_statuses(&self) -> Vec<TierStatus> {
        TierKind::ALL
            .into_iter()
            .map(|tier| {
                let (configured, healthy) = match tier {
                    TierKind::Memory | TierKind::Session => (true, true),
                    remote => self
                        .remote(remote)
                        .map_or((false, false), |t| (true, t.is_healthy())),
                };
                TierStatus {
                    tier,
                    configured,
                    enabled: self.is_enabled(tier),
                    healthy,
                }
            })
            .collect()
    }

    /// Push tier sizes and health into the collector and recompute the
    /// preferred provider
    pub fn refresh_metrics(&self) {
        let memory = self.memory.stats();
        let sessions = self.sessions.stats();

        for status in self.tier_statuses() {
            let (size, max_size) = match status.tier {
                TierKind::Memory => (memory.entries as u64, memory.max_entries as u64),
                TierKind::Session => (sessions.total_items as u64, sessions.max_total_size as u64),
                _ => (0, 0),
            };
            self.metrics.update_tier(
                status.tier,
                status.configured,
                status.healthy && status.enabled,
                size,
                max_size,
            );
        }
        self.metrics
            .update_memory_usage(memory.memory_bytes as u64, memory.max_memory_bytes as u64);
        self.metrics.refresh_preferred_provider();
    }

    /// Read a key
    ///
    /// A session-scoped read checks the session first, then falls back to the
    /// shared waterfall.
    pub async fn get(&self, key: &str, session_id: Option<&str>) -> Option<Value> {
        let start = Instant::now();

        let found = match self.get_scoped(key, session_id) {
            Some(value) => Some(value),
            None => self.get_shared(key).await,
        };

        self.metrics.record_get(found.is_some(), start.elapsed());
        self.refresh_metrics();
        found
    }

    fn get_scoped(&self, key: &str, session_id: Option<&str>) -> Option<Value> {
        let sid = session_id.filter(|_| self.is_usable(TierKind::Session, true))?;
        match self.sessions.get(sid, key) {
            Some(value) => {
                debug!("Tiered HIT key={}, tier=session, session={}", key, sid);
                self.metrics.record_tier_hit(TierKind::Session);
                Some(value)
            }
            None => {
                self.metrics.record_tier_miss(TierKind::Session);
                None
            }
        }
    }

    /// Walk the shared tiers in order and return the first hit
    async fn get_shared(&self, key: &str) -> Option<Value> {
        let mut found = None;

        for kind in self.config.tier_order.iter().copied() {
            if !self.is_usable(kind, false) {
                continue;
            }

            let result = match self.remote(kind) {
                Some(tier) => tier.try_get(key).await,
                None => Ok(self.memory.get(key)),
            };

            match result {
                Ok(Some(value)) => {
                    debug!("Tiered HIT key={}, tier={}", key, kind);
                    self.metrics.record_tier_hit(kind);
                    found = Some((kind, value));
                    break;
                }
                Ok(None) => self.metrics.record_tier_miss(kind),
                Err(err) => {
                    self.metrics
                        .record_error(Some(kind), "get", key, err.to_string());
                }
            }
        }

        match found {
            Some((kind, value)) => {
                self.warm_faster_tiers(key, &value, kind);
                Some(value)
            }
            None => {
                debug!("Tiered MISS key={}", key);
                None
            }
        }
    }

    /// Populate every usable shared tier faster than `hit` with its own TTL
    fn warm_faster_tiers(&self, key: &str, value: &Value, hit: TierKind) {
        let mut remote_targets = Vec::new();

        for kind in TierKind::ALL {
            if kind.rank() >= hit.rank() || !self.is_usable(kind, false) {
                continue;
            }
            match self.remote(kind) {
                Some(tier) => remote_targets.push(tier.clone()),
                None => {
                    self.memory.set(key, value.clone(), SetOptions::default());
                }
            }
            debug!("Warming tier={} key={} from {}", kind, key, hit);
        }

        if !remote_targets.is_empty() {
            tokio::spawn(fan_out(
                remote_targets,
                key.to_string(),
                value.clone(),
                None,
                self.metrics.clone(),
                "warm",
            ));
        }
    }

    /// Write a key
    ///
    /// Session-scoped writes stay in the session tier. Shared writes go to
    /// every usable shared tier; remote failures are recorded and never
    /// returned.
    pub async fn set(&self, key: &str, value: Value, options: &CacheOptions) {
        let start = Instant::now();

        if let Some(sid) = options.session_id.as_deref() {
            if self.is_usable(TierKind::Session, true) {
                self.sessions.set(sid, key, value, options.ttl);
                debug!("Tiered SET key={}, session={}", key, sid);
            } else {
                warn!("Session tier disabled, dropping SET key={}, session={}", key, sid);
            }
            self.metrics.record_set(start.elapsed());
            self.refresh_metrics();
            return;
        }

        let write_through = options.write_through.unwrap_or(self.config.write_through);
        self.memory.set(
            key,
            value.clone(),
            options.set_options(self.config.memory.default_ttl),
        );

        let targets = self.usable_remotes();
        if !targets.is_empty() {
            let write = fan_out(
                targets,
                key.to_string(),
                value,
                options.ttl,
                self.metrics.clone(),
                "set",
            );
            if write_through {
                write.await;
            } else {
                tokio::spawn(write);
            }
        }

        debug!("Tiered SET key={}, write_through={}", key, write_through);
        self.metrics.record_set(start.elapsed());
        self.refresh_metrics();
    }

    /// Remove a key; true when any tier held it
    ///
    /// A session-scoped delete only touches that session.
    pub async fn delete(&self, key: &str, session_id: Option<&str>) -> bool {
        let start = Instant::now();

        let removed = match session_id {
            Some(sid) => self.sessions.delete(sid, key),
            None => {
                let mut removed = self.memory.delete(key);
                for tier in self.usable_remotes() {
                    match tier.try_delete(key).await {
                        Ok(hit) => removed |= hit,
                        Err(err) => {
                            self.metrics
                                .record_error(Some(tier.kind()), "delete", key, err.to_string());
                        }
                    }
                }
                removed
            }
        };

        debug!("Tiered DELETE key={}, session={:?}, removed={}", key, session_id, removed);
        self.metrics.record_delete(start.elapsed());
        self.refresh_metrics();
        removed
    }

    /// Whether a read would find a live value, without counting an access
    pub async fn exists(&self, key: &str, session_id: Option<&str>) -> bool {
        if let Some(sid) = session_id {
            if self.is_usable(TierKind::Session, true) && self.sessions.has(sid, key) {
                return true;
            }
        }
        if self.memory.has(key) {
            return true;
        }

        for tier in self.usable_remotes() {
            match tier.try_exists(key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    self.metrics
                        .record_error(Some(tier.kind()), "exists", key, err.to_string());
                }
            }
        }
        false
    }

    /// Remove keys matching `pattern` (or everything) from every tier
    ///
    /// Returns the number of entries removed across tiers.
    pub async fn clear(&self, pattern: Option<&str>) -> usize {
        let start = Instant::now();
        let mut removed = self.memory.clear(pattern) + self.sessions.clear_matching(pattern);

        for tier in self.usable_remotes() {
            match tier.try_clear(pattern).await {
                Ok(count) => removed += count,
                Err(err) => {
                    self.metrics.record_error(
                        Some(tier.kind()),
                        "clear",
                        pattern.unwrap_or("*"),
                        err.to_string(),
                    );
                }
            }
        }

        info!("Tiered CLEAR pattern={:?}, removed={}", pattern, removed);
        self.metrics.record_invalidation(removed, start.elapsed());
        self.refresh_metrics();
        removed
    }

    /// Keys matching `pattern` across the memory and remote tiers
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let mut keys: Vec<String> = self.memory.keys(Some(pattern));
        for tier in self.usable_remotes() {
            keys.extend(tier.keys(pattern).await);
        }
        keys.sort();
        keys.dedup();
        keys
    }

    /// Sweep expired entries from the in-process tiers
    pub fn cleanup(&self) -> (usize, SessionCleanup) {
        let memory = self.memory.cleanup();
        let sessions = self.sessions.cleanup();
        self.refresh_metrics();
        (memory, sessions)
    }

    /// Probe every configured remote tier, restoring the ones that answer
    pub async fn probe_health(&self) -> Vec<(TierKind, bool)> {
        let mut results = Vec::new();
        for tier in self.remotes() {
            let healthy = tier.health_check().await;
            results.push((tier.kind(), healthy));
        }
        self.refresh_metrics();
        results
    }

    /// Run [`TieredCache::probe_health`] periodically
    pub fn start_health_probe(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        info!("Starting remote health probe (interval={:?})", interval);

        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for (tier, healthy) in cache.probe_health().await {
                    if !healthy {
                        warn!("Health probe: tier {} still unavailable", tier);
                    }
                }
            }
        })
    }
}

/// Write one value to several remote tiers concurrently, recording failures
async fn fan_out(
    targets: Vec<RemoteTier>,
    key: String,
    value: Value,
    ttl: Option<Duration>,
    metrics: Arc<MetricsCollector>,
    operation: &'static str,
) {
    let writes = targets.iter().map(|tier| tier.try_set(&key, &value, ttl));
    let results = join_all(writes).await;

    for (tier, result) in targets.iter().zip(results) {
        if let Err(err) = result {
            warn!(tier = %tier.kind(), operation, key = %key, "Remote write failed: {}", err);
            metrics.record_error(Some(tier.kind()), operation, &key, err.to_string());
        }
    }
}
