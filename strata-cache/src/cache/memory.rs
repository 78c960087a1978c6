//! In-memory tier
//!
//! Bounded map with per-entry TTL. Expiry is lazy (checked on access) plus a
//! periodic sweep. When an insert would exceed the entry or byte budget, one
//! entry per overflow is evicted according to the configured
//! [`EvictionStrategy`].

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::key::matches_pattern;
use crate::core::{CacheEntry, DEFAULT_PRIORITY, EvictionStrategy, SetOptions, SharedClock};

/// Size assumed for values that cannot be serialized
pub const DEFAULT_ENTRY_SIZE: usize = 1024;

/// Hook invoked synchronously with every evicted entry
pub type EvictionCallback<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

/// Configuration for the in-memory tier
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub default_ttl: Duration,
    pub strategy: EvictionStrategy,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_memory_bytes: 100 * 1024 * 1024,
            default_ttl: Duration::from_secs(3600),
            strategy: EvictionStrategy::Lru,
        }
    }
}

/// Statistics for the in-memory tier
#[derive(Debug, Default, Clone, Serialize)]
pub struct MemoryTierStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Values refused for exceeding the whole byte budget
    pub rejections: u64,
    pub strategy: EvictionStrategy,
}

impl MemoryTierStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    rejections: AtomicU64,
}

struct Slot<V> {
    entry: CacheEntry<V>,
    /// Monotonic recency stamp, breaks ties between equal timestamps
    seq: u64,
}

struct Store<V> {
    entries: HashMap<String, Slot<V>>,
    total_bytes: usize,
    seq: u64,
}

impl<V> Store<V> {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn insert(&mut self, key: String, entry: CacheEntry<V>) {
        let seq = self.next_seq();
        self.total_bytes += entry.size_bytes;
        self.entries.insert(key, Slot { entry, seq });
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let slot = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot.entry)
    }

    fn select_victim(&self, strategy: EvictionStrategy) -> Option<String> {
        let candidates = self.entries.iter();
        let victim = match strategy {
            EvictionStrategy::Lru => {
                candidates.min_by_key(|(_, s)| (s.entry.last_accessed_at, s.seq))
            }
            EvictionStrategy::Lfu => {
                candidates.min_by_key(|(_, s)| (s.entry.access_count, s.entry.last_accessed_at, s.seq))
            }
            EvictionStrategy::Priority => {
                candidates.min_by_key(|(_, s)| (s.entry.priority, s.entry.last_accessed_at, s.seq))
            }
        };
        victim.map(|(key, _)| key.clone())
    }
}

/// Estimate the footprint of a value as 2 bytes per UTF-16 unit of its JSON form
pub fn estimate_size<V: Serialize + ?Sized>(value: &V) -> usize {
    match serde_json::to_string(value) {
        Ok(json) => json.encode_utf16().count() * 2,
        Err(err) => {
            debug!("Size estimation failed, using default: {}", err);
            DEFAULT_ENTRY_SIZE
        }
    }
}

/// Bounded in-process cache tier
#[derive(Clone)]
pub struct MemoryTier<V> {
    store: Arc<Mutex<Store<V>>>,
    counters: Arc<Counters>,
    config: MemoryTierConfig,
    clock: SharedClock,
    on_evict: Option<EvictionCallback<V>>,
}

impl<V> MemoryTier<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Create a new in-memory tier
    pub fn new(config: MemoryTierConfig, clock: SharedClock) -> Self {
        info!(
            "Initializing memory tier with max_entries={}, max_memory={}B, strategy={:?}",
            config.max_entries, config.max_memory_bytes, config.strategy
        );

        Self {
            store: Arc::new(Mutex::new(Store {
                entries: HashMap::new(),
                total_bytes: 0,
                seq: 0,
            })),
            counters: Arc::new(Counters::default()),
            config,
            clock,
            on_evict: None,
        }
    }

    /// Register the eviction hook
    pub fn with_eviction_callback(mut self, callback: EvictionCallback<V>) -> Self {
        self.on_evict = Some(callback);
        self
    }

    pub fn config(&self) -> &MemoryTierConfig {
        &self.config
    }

    /// Start background expiry sweep
    pub fn start_cleanup(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        info!("Starting memory tier cleanup task (interval={:?})", interval);

        let tier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = tier.cleanup();
                if removed > 0 {
                    debug!("Memory tier cleanup removed {} expired entries", removed);
                }
            }
        })
    }

    /// Get a value, deleting it if expired
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut store = self.store.lock();

        let expired = match store.entries.get(key) {
            Some(slot) => slot.entry.is_expired(now),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Memory MISS key={}", key);
                return None;
            }
        };

        if expired {
            store.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Memory EXPIRED key={}", key);
            return None;
        }

        let seq = store.next_seq();
        let slot = store.entries.get_mut(key)?;
        slot.entry.touch(now);
        slot.seq = seq;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!("Memory HIT key={}", key);
        Some(slot.entry.data.clone())
    }

    /// Store a value, evicting as needed to stay within budget
    ///
    /// A value larger than the whole byte budget is refused and any previous
    /// value under `key` is dropped. Returns whether the value was stored.
    pub fn set(&self, key: &str, value: V, options: SetOptions) -> bool {
        let now = self.clock.now_millis();
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let priority = options.priority.unwrap_or(DEFAULT_PRIORITY);
        let size = estimate_size(&value);

        if size > self.config.max_memory_bytes {
            self.store.lock().remove(key);
            self.counters.rejections.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Memory REJECT key={}, size={} exceeds budget {}",
                key, size, self.config.max_memory_bytes
            );
            return false;
        }

        let mut evicted = Vec::new();
        {
            let mut store = self.store.lock();
            let access_count = store.remove(key).map_or(0, |old| old.access_count);

            while !store.entries.is_empty()
                && (store.entries.len() >= self.config.max_entries
                    || store.total_bytes + size > self.config.max_memory_bytes)
            {
                let Some(victim) = store.select_victim(self.config.strategy) else {
                    break;
                };
                if let Some(entry) = store.remove(&victim) {
                    evicted.push((victim, entry.data));
                }
            }

            let mut entry = CacheEntry::new(value, now, ttl, priority, size);
            entry.access_count = access_count;
            store.insert(key.to_string(), entry);
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        debug!("Memory SET key={}, size={}, ttl={:?}", key, size, ttl);

        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            for (evicted_key, data) in &evicted {
                debug!("Memory EVICT key={} ({:?})", evicted_key, self.config.strategy);
                if let Some(callback) = &self.on_evict {
                    callback(evicted_key, data);
                }
            }
        }
        true
    }

    /// Write, read back and remove `value` under `key` in one step
    ///
    /// Skips capacity checks and leaves counters and recency untouched.
    pub fn roundtrip(&self, key: &str, value: V) -> bool
    where
        V: PartialEq,
    {
        let now = self.clock.now_millis();
        let mut store = self.store.lock();
        let seq = store.seq;

        let entry = CacheEntry::new(value.clone(), now, self.config.default_ttl, DEFAULT_PRIORITY, 0);
        let previous = store.entries.insert(key.to_string(), Slot { entry, seq });
        let ok = store.entries.get(key).is_some_and(|slot| slot.entry.data == value);

        match previous {
            Some(previous) => {
                store.entries.insert(key.to_string(), previous);
            }
            None => {
                store.entries.remove(key);
            }
        }
        ok
    }

    /// Delete a key
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.store.lock().remove(key).is_some();
        if removed {
            debug!("Memory DELETE key={}", key);
        }
        removed
    }

    /// Check if a live key exists without counting an access
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut store = self.store.lock();
        match store.entries.get(key) {
            Some(slot) if slot.entry.is_expired(now) => {
                store.remove(key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Remaining TTL of a live key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let store = self.store.lock();
        store
            .entries
            .get(key)
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.remaining_ttl(now))
    }

    /// Remove every key, or only those matching `pattern`
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let mut store = self.store.lock();
        let count = match pattern {
            None => {
                let count = store.entries.len();
                store.entries.clear();
                store.total_bytes = 0;
                count
            }
            Some(pattern) => {
                let doomed: Vec<String> = store
                    .entries
                    .keys()
                    .filter(|k| matches_pattern(pattern, k))
                    .cloned()
                    .collect();
                for key in &doomed {
                    store.remove(key);
                }
                doomed.len()
            }
        };

        debug!("Memory CLEAR pattern={:?} ({} entries)", pattern, count);
        count
    }

    /// Live keys, optionally filtered by pattern, sorted
    pub fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let now = self.clock.now_millis();
        let store = self.store.lock();
        let mut keys: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, slot)| !slot.entry.is_expired(now))
            .filter(|(k, _)| pattern.is_none_or(|p| matches_pattern(p, k)))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove expired entries
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let mut store = self.store.lock();

        let expired: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            store.remove(key);
        }

        let count = expired.len();
        if count > 0 {
            self.counters
                .expirations
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_bytes(&self) -> usize {
        self.store.lock().total_bytes
    }

    /// Get statistics
    pub fn stats(&self) -> MemoryTierStats {
        let (entries, memory_bytes) = {
            let store = self.store.lock();
            (store.entries.len(), store.total_bytes)
        };

        MemoryTierStats {
            entries,
            memory_bytes,
            max_entries: self.config.max_entries,
            max_memory_bytes: self.config.max_memory_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            strategy: self.config.strategy,
        }
    }
}
