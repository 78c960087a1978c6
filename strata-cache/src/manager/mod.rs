//! Top-level cache orchestrator
//!
//! `CacheManager` composes the tiered cache, the session tier and metrics with
//! request deduplication and memoization. Build one per process (or per test)
//! and share it by `Arc`.

pub mod dedup;
pub mod memoize;

pub use dedup::Deduplicator;
pub use memoize::{KeyGenerator, MemoizeOptions, Memoized};

use futures_util::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{LocalStore, RemoteStore, SessionTier, TieredCache};
use crate::config::{CacheConfig, RemoteBackend};
use crate::core::key::WILDCARD;
use crate::core::{
    CacheError, CacheOptions, HealthStatus, Result, SharedClock, TierKind, TierStatus,
    system_clock, validate_key,
};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use memoize::MemoMaintenance;

/// A key to preload and the fetch that produces its value
pub struct WarmEntry {
    pub key: String,
    pub fetcher: BoxFuture<'static, Result<Value>>,
    pub options: CacheOptions,
}

impl WarmEntry {
    pub fn new<Fut>(key: impl Into<String>, fetcher: Fut) -> Self
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            key: key.into(),
            fetcher: Box::pin(fetcher),
            options: CacheOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of a warm-up run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WarmReport {
    pub total: usize,
    pub succeeded: usize,
    /// Keys that failed, with the reason
    pub failed: Vec<(String, String)>,
}

/// Result of [`CacheManager::health_check`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub memory_roundtrip: bool,
    pub tiers: Vec<TierStatus>,
    pub issues: Vec<String>,
    pub timestamp: u64,
}

/// What a maintenance sweep removed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub memory_entries: usize,
    pub sessions: usize,
    pub session_items: usize,
    pub dedup_entries: usize,
    pub memoized_results: usize,
}

/// Assembles a [`CacheManager`] with an injected clock or remote stores
pub struct CacheManagerBuilder {
    config: CacheConfig,
    clock: Option<SharedClock>,
    primary: Option<Arc<dyn RemoteStore>>,
    secondary: Option<Arc<dyn RemoteStore>>,
}

impl CacheManagerBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `store` for a remote slot instead of the configured backend
    pub fn remote(mut self, kind: TierKind, store: Arc<dyn RemoteStore>) -> Self {
        match kind {
            TierKind::RemoteSecondary => self.secondary = Some(store),
            _ => self.primary = Some(store),
        }
        self
    }

    pub fn build(self) -> Result<CacheManager> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(system_clock);

        let configured = |backend: RemoteBackend, name: &str| -> Option<Arc<dyn RemoteStore>> {
            match backend {
                RemoteBackend::None => None,
                RemoteBackend::Local => Some(Arc::new(LocalStore::new(name, clock.clone()))),
            }
        };
        let primary = self
            .primary
            .or_else(|| configured(self.config.remote.primary, "local-primary"));
        let secondary = self
            .secondary
            .or_else(|| configured(self.config.remote.secondary, "local-secondary"));

        let metrics = Arc::new(MetricsCollector::new(
            self.config.metrics.clone(),
            clock.clone(),
        )?);
        let mut cache = TieredCache::new(self.config.tiered_config(), clock.clone(), metrics.clone())?;
        if let Some(store) = primary {
            cache = cache.with_remote(TierKind::RemotePrimary, store)?;
        }
        if let Some(store) = secondary {
            cache = cache.with_remote(TierKind::RemoteSecondary, store)?;
        }

        info!("Cache manager ready");
        Ok(CacheManager {
            dedup: Deduplicator::new(
                Duration::from_secs(self.config.dedup.window_secs),
                clock.clone(),
            ),
            cache,
            metrics,
            memos: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            clock,
            config: self.config,
        })
    }
}

/// Multi-tier cache with deduplication and memoization
pub struct CacheManager {
    cache: TieredCache,
    metrics: Arc<MetricsCollector>,
    dedup: Deduplicator,
    memos: Mutex<Vec<Weak<dyn MemoMaintenance>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    clock: SharedClock,
    config: CacheConfig,
}

fn validate_pattern(pattern: &str) -> Result<()> {
    let literal: String = pattern.chars().filter(|c| *c != WILDCARD).collect();
    if literal.is_empty() {
        return Ok(());
    }
    validate_key(&literal)
}

impl CacheManager {
    /// Manager with the wall clock and the configured remote backends
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> CacheManagerBuilder {
        CacheManagerBuilder {
            config,
            clock: None,
            primary: None,
            secondary: None,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn tiered(&self) -> &TieredCache {
        &self.cache
    }

    /// The session tier, for session lifecycle operations
    pub fn sessions(&self) -> &SessionTier<Value> {
        self.cache.sessions()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_with(key, &CacheOptions::default()).await
    }

    /// Read through the tiers; a value of the wrong shape is a
    /// `SerializationError`
    pub async fn get_with<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &CacheOptions,
    ) -> Result<Option<T>> {
        validate_key(key)?;
        match self.cache.get(key, options.session_id.as_deref()).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Raw JSON read used by the HTTP surface
    pub async fn get_value(&self, key: &str, options: &CacheOptions) -> Result<Option<Value>> {
        validate_key(key)?;
        Ok(self.cache.get(key, options.session_id.as_deref()).await)
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
    ) -> Result<()> {
        validate_key(key)?;
        let value = serde_json::to_value(value)?;
        self.cache.set(key, value, options).await;
        Ok(())
    }

    pub async fn delete(&self, key: &str, options: &CacheOptions) -> Result<bool> {
        validate_key(key)?;
        Ok(self.cache.delete(key, options.session_id.as_deref()).await)
    }

    pub async fn has(&self, key: &str, options: &CacheOptions) -> Result<bool> {
        validate_key(key)?;
        Ok(self.cache.exists(key, options.session_id.as_deref()).await)
    }

    /// Remove every key matching a glob pattern from all tiers
    pub async fn invalidate(&self, pattern: &str) -> Result<usize> {
        validate_pattern(pattern)?;
        Ok(self.cache.clear(Some(pattern)).await)
    }

    /// Cache-aside: return the cached value or fetch, store and return it
    ///
    /// The fetcher runs at most once per call. A cached value that does not
    /// decode as `T` counts as a miss and is overwritten.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        options: &CacheOptions,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CacheError>,
    {
        match self.get_with::<T>(key, options).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(CacheError::SerializationError(reason)) => {
                debug!("Cached value for {} did not decode, refetching: {}", key, reason);
            }
            Err(err) => return Err(err.into()),
        }

        let start = Instant::now();
        let fetched = fetcher().await;
        self.metrics.record_operation(
            "fetch",
            if fetched.is_ok() { "success" } else { "error" },
            start.elapsed(),
        );
        let value = fetched?;

        self.set(key, &value, options).await?;
        Ok(value)
    }

    /// Share one in-flight fetch among calls for `key` within `window`
    pub async fn deduplicate<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        window: Option<Duration>,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.dedup.run(key, fetcher, window).await
    }

    /// Wrap a pure async function with a bounded result map
    pub fn memoize<A, R, F, Fut>(
        &self,
        name: &str,
        func: F,
        options: Option<MemoizeOptions<A>>,
    ) -> Memoized<A, R, F>
    where
        A: Serialize + PartialEq + Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let options = options.unwrap_or_else(|| {
            MemoizeOptions::new(
                Duration::from_secs(self.config.memoize.ttl_secs),
                self.config.memoize.max_entries,
            )
        });
        let memoized = Memoized::new(name, func, options, self.clock.clone());

        let mut memos = self.memos.lock();
        memos.retain(|m| m.strong_count() > 0);
        memos.push(Arc::downgrade(&memoized.maintenance()));
        memoized
    }

    /// Fetch and store many entries in parallel, tolerating failures
    pub async fn warm(&self, entries: Vec<WarmEntry>) -> WarmReport {
        let total = entries.len();
        let outcomes = join_all(entries.into_iter().map(
            |WarmEntry {
                 key,
                 fetcher,
                 options,
             }| async move {
                let outcome = match validate_key(&key) {
                    Ok(()) => match fetcher.await {
                        Ok(value) => {
                            self.cache.set(&key, value, &options).await;
                            Ok(())
                        }
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                };
                (key, outcome)
            },
        ))
        .await;

        let mut report = WarmReport {
            total,
            ..Default::default()
        };
        for (key, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    warn!("Warm-up failed for {}: {}", key, err);
                    report.failed.push((key, err.to_string()));
                }
            }
        }

        info!("Warmed {}/{} entries", report.succeeded, report.total);
        report
    }

    /// Sentinel round trip on the memory tier combined with the metrics verdict
    pub async fn health_check(&self) -> HealthReport {
        let sentinel = format!("health:{}", uuid::Uuid::new_v4().simple());
        let memory_roundtrip = self
            .cache
            .memory()
            .roundtrip(&sentinel, Value::String(sentinel.clone()));

        self.cache.refresh_metrics();
        let verdict = self.metrics.health();
        let mut issues = verdict.issues;
        let status = if memory_roundtrip {
            verdict.status
        } else {
            issues.insert(0, "memory tier failed sentinel round trip".to_string());
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            memory_roundtrip,
            tiers: self.cache.tier_statuses(),
            issues,
            timestamp: self.clock.now_millis(),
        }
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.cache.refresh_metrics();
        self.metrics.snapshot()
    }

    /// Human-readable report
    pub fn get_summary(&self) -> String {
        self.get_metrics().summary()
    }

    pub fn encode_prometheus(&self) -> Result<String> {
        self.cache.refresh_metrics();
        self.metrics.encode_prometheus()
    }

    /// Sweep expired data from every in-process structure
    pub fn cleanup(&self) -> CleanupReport {
        let (memory_entries, sessions) = self.cache.cleanup();
        let dedup_entries = self.dedup.cleanup();

        let mut memoized_results = 0;
        let mut memos = self.memos.lock();
        memos.retain(|weak| match weak.upgrade() {
            Some(memo) => {
                memoized_results += memo.cleanup();
                true
            }
            None => false,
        });

        let report = CleanupReport {
            memory_entries,
            sessions: sessions.sessions_removed,
            session_items: sessions.items_removed,
            dedup_entries,
            memoized_results,
        };
        debug!("Cleanup: {:?}", report);
        report
    }

    /// Empty every tier and in-process map and start metrics afresh
    pub async fn clear(&self) -> usize {
        let removed = self.cache.clear(None).await;
        self.dedup.clear();
        for memo in self.memos.lock().iter().filter_map(Weak::upgrade) {
            memo.clear();
        }
        self.reset_metrics();
        removed
    }

    /// Zero counters and the error log so the health verdict starts over
    pub fn reset_metrics(&self) {
        self.metrics.reset();
        self.cache.refresh_metrics();
        info!("Metrics reset");
    }

    /// Spawn memory cleanup, session cleanup and the remote health probe
    pub fn start_maintenance(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(
            self.cache
                .memory()
                .start_cleanup(Duration::from_secs(self.config.memory.cleanup_interval_secs)),
        );
        tasks.push(
            self.cache
                .sessions()
                .start_cleanup(Duration::from_secs(self.config.session.cleanup_interval_secs)),
        );
        tasks.push(self.cache.start_health_probe(Duration::from_secs(
            self.config.remote.health_check_interval_secs,
        )));
    }

    /// Stop the maintenance tasks
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            info!("Stopping {} maintenance tasks", tasks.len());
        }
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
