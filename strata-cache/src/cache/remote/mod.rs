//! Remote tier contract and its self-healing adapter

mod local;

pub use local::LocalStore;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{CacheError, Result, TierKind};

/// Narrow contract a distributed store must satisfy to serve as a remote tier
///
/// Implementations report infrastructure failures as errors; the adapter
/// decides what to do with them.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Identifier used in logs
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys matching a glob pattern
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Remove keys matching `pattern`, or everything
    async fn clear(&self, pattern: Option<&str>) -> Result<usize>;

    /// Whether the store can currently serve requests
    async fn health_check(&self) -> Result<bool>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn mset(&self, entries: &[(String, Value)], ttl: Duration) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value, ttl).await?;
        }
        Ok(())
    }
}

/// A remote store bound to a tier slot, with a health flag
///
/// `try_*` operations hand failures back to the tiered cache after marking
/// the tier unhealthy. The plain operations swallow failures and return a
/// neutral value.
#[derive(Clone)]
pub struct RemoteTier {
    kind: TierKind,
    store: Arc<dyn RemoteStore>,
    default_ttl: Duration,
    healthy: Arc<AtomicBool>,
}

impl RemoteTier {
    pub fn new(kind: TierKind, store: Arc<dyn RemoteStore>, default_ttl: Duration) -> Self {
        info!(
            "Attaching remote store '{}' as {} (ttl={:?})",
            store.name(),
            kind,
            default_ttl
        );

        Self {
            kind,
            store,
            default_ttl,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TierKind {
        self.kind
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a failure and flip the tier unhealthy
    fn fail(&self, operation: &str, key: &str, err: CacheError) -> CacheError {
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!(
                tier = %self.kind,
                operation,
                key,
                "Remote tier marked unhealthy: {}",
                err
            );
        } else {
            debug!(tier = %self.kind, operation, key, "Remote tier still failing: {}", err);
        }
        err
    }

    pub async fn try_get(&self, key: &str) -> Result<Option<Value>> {
        self.store
            .get(key)
            .await
            .map_err(|e| self.fail("get", key, e))
    }

    pub async fn try_set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.store
            .set(key, value, ttl)
            .await
            .map_err(|e| self.fail("set", key, e))
    }

    pub async fn try_delete(&self, key: &str) -> Result<bool> {
        self.store
            .delete(key)
            .await
            .map_err(|e| self.fail("delete", key, e))
    }

    pub async fn try_exists(&self, key: &str) -> Result<bool> {
        self.store
            .exists(key)
            .await
            .map_err(|e| self.fail("exists", key, e))
    }

    pub async fn try_clear(&self, pattern: Option<&str>) -> Result<usize> {
        self.store
            .clear(pattern)
            .await
            .map_err(|e| self.fail("clear", pattern.unwrap_or("*"), e))
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.try_get(key).await.ok().flatten()
    }

    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        self.try_set(key, value, ttl).await.is_ok()
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.try_delete(key).await.unwrap_or(false)
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.try_exists(key).await.unwrap_or(false)
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.store
            .keys(pattern)
            .await
            .map_err(|e| self.fail("keys", pattern, e))
            .unwrap_or_default()
    }

    pub async fn clear(&self, pattern: Option<&str>) -> usize {
        self.try_clear(pattern).await.unwrap_or(0)
    }

    pub async fn mget(&self, keys: &[String]) -> Vec<Option<Value>> {
        match self.store.mget(keys).await {
            Ok(values) => values,
            Err(e) => {
                self.fail("mget", &keys.join(","), e);
                vec![None; keys.len()]
            }
        }
    }

    pub async fn mset(&self, entries: &[(String, Value)], ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        match self.store.mset(entries, ttl).await {
            Ok(()) => true,
            Err(e) => {
                self.fail("mset", &format!("{} keys", entries.len()), e);
                false
            }
        }
    }

    /// Cache-aside against this tier alone
    ///
    /// Only the fetcher's own error is returned; store failures degrade to a
    /// fetch without caching.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Option<Duration>,
    ) -> std::result::Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = fetcher().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Probe the store and update the health flag accordingly
    pub async fn health_check(&self) -> bool {
        let healthy = match self.store.health_check().await {
            Ok(ok) => ok,
            Err(e) => {
                debug!(tier = %self.kind, "Health probe failed: {}", e);
                false
            }
        };

        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        if healthy && !was {
            info!(tier = %self.kind, "Remote tier recovered");
        } else if !healthy && was {
            warn!(tier = %self.kind, "Remote tier failed health probe");
        }
        healthy
    }
}
