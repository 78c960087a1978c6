use async_trait::async_trait;
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::RemoteStore;
use crate::core::key::{literal_prefix, matches_pattern};
use crate::core::{CacheError, Result, SharedClock};

#[derive(Debug, Clone)]
struct StoredValue {
    data: Value,
    expires_at: u64,
}

impl StoredValue {
    fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// In-process remote store backed by a radix trie
///
/// Stands in for a distributed cache in single-node deployments and tests.
/// It can be switched offline to exercise failover.
#[derive(Clone)]
pub struct LocalStore {
    name: String,
    data: Arc<RwLock<Trie<String, StoredValue>>>,
    clock: SharedClock,
    available: Arc<AtomicBool>,
    operations: Arc<AtomicU64>,
}

impl LocalStore {
    pub fn new(name: impl Into<String>, clock: SharedClock) -> Self {
        let name = name.into();
        info!("Initializing local remote store '{}'", name);

        Self {
            name,
            data: Arc::new(RwLock::new(Trie::new())),
            clock,
            available: Arc::new(AtomicBool::new(true)),
            operations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        info!("Local store '{}' available={}", self.name, available);
        self.available.store(available, Ordering::Release);
    }

    /// Operations attempted since creation, including rejected ones
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.data
            .read()
            .iter()
            .filter(|(_, v)| !v.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::unavailable(self.name.as_str(), "store offline"))
        }
    }

    fn matching_keys(&self, pattern: &str, now: u64) -> Vec<String> {
        let data = self.data.read();
        let prefix = literal_prefix(pattern);
        let live = |(k, v): (&String, &StoredValue)| {
            (!v.is_expired(now) && matches_pattern(pattern, k)).then(|| k.clone())
        };

        let mut keys: Vec<String> = if prefix.is_empty() {
            data.iter().filter_map(live).collect()
        } else {
            data.get_raw_descendant(prefix)
                .map(|subtrie| subtrie.iter().filter_map(live).collect())
                .unwrap_or_default()
        };
        keys.sort();
        keys
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check()?;
        let now = self.clock.now_millis();

        let mut data = self.data.write();
        let expired = match data.get(key) {
            Some(stored) => stored.is_expired(now),
            None => return Ok(None),
        };
        if expired {
            debug!("Local store key expired: {}", key);
            data.remove(key);
            return Ok(None);
        }
        Ok(data.get(key).map(|stored| stored.data.clone()))
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        self.check()?;
        let now = self.clock.now_millis();
        debug!("Local store SET key={}, ttl={:?}", key, ttl);

        self.data.write().insert(
            key.to_string(),
            StoredValue {
                data: value.clone(),
                expires_at: now.saturating_add(ttl.as_millis() as u64),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.data.write().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        let now = self.clock.now_millis();
        Ok(self
            .data
            .read()
            .get(key)
            .is_some_and(|stored| !stored.is_expired(now)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.matching_keys(pattern, self.clock.now_millis()))
    }

    async fn clear(&self, pattern: Option<&str>) -> Result<usize> {
        self.check()?;

        match pattern {
            None => {
                let mut data = self.data.write();
                let count = data.len();
                *data = Trie::new();
                Ok(count)
            }
            Some(pattern) => {
                // Expired keys matching the pattern go too
                let doomed: Vec<String> = {
                    let data = self.data.read();
                    data.keys()
                        .filter(|k| matches_pattern(pattern, k))
                        .cloned()
                        .collect()
                };
                let mut data = self.data.write();
                for key in &doomed {
                    data.remove(key.as_str());
                }
                Ok(doomed.len())
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        self.check()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use serde_json::json;

    fn store() -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (LocalStore::new("local", clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (store, _) = store();

        store
            .set("user:1", &json!({"name": "alice"}), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            store.get("user:1").await.unwrap(),
            Some(json!({"name": "alice"}))
        );
        assert!(store.exists("user:1").await.unwrap());

        assert!(store.delete("user:1").await.unwrap());
        assert!(!store.delete("user:1").await.unwrap());
        assert_eq!(store.get("user:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let (store, clock) = store();

        store
            .set("k", &json!(1), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(1000));
        assert!(store.exists("k").await.unwrap());

        clock.advance(Duration::from_millis(1));
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_by_pattern() {
        let (store, _) = store();
        let ttl = Duration::from_secs(10);

        store.set("user:1", &json!(1), ttl).await.unwrap();
        store.set("user:2", &json!(2), ttl).await.unwrap();
        store.set("product:1", &json!(3), ttl).await.unwrap();

        assert_eq!(store.keys("user:*").await.unwrap(), vec!["user:1", "user:2"]);
        assert_eq!(store.keys("*:1").await.unwrap(), vec!["product:1", "user:1"]);
        assert_eq!(store.keys("*").await.unwrap().len(), 3);
        assert!(store.keys("order:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _) = store();
        let ttl = Duration::from_secs(10);

        store.set("img:1", &json!(1), ttl).await.unwrap();
        store.set("img:2", &json!(2), ttl).await.unwrap();
        store.set("desc:1", &json!(3), ttl).await.unwrap();

        assert_eq!(store.clear(Some("img:*")).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.clear(None).await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_offline_rejects_everything() {
        let (store, _) = store();
        store.set_available(false);

        assert!(store.get("k").await.is_err());
        assert!(store.set("k", &json!(1), Duration::from_secs(1)).await.is_err());
        assert!(store.health_check().await.is_err());
        assert_eq!(store.operation_count(), 3);

        store.set_available(true);
        assert!(store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_default_mget() {
        let (store, _) = store();
        store
            .set("a", &json!("x"), Duration::from_secs(5))
            .await
            .unwrap();

        let values = store
            .mget(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(json!("x")), None]);
    }
}
