//! Memoization of pure async functions

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::core::{CacheKeys, Result, SharedClock};

/// Builds the memo key from the call arguments
pub type KeyGenerator<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// Options for [`crate::CacheManager::memoize`]
pub struct MemoizeOptions<A> {
    pub ttl: Duration,
    pub max_entries: usize,
    pub key_generator: Option<KeyGenerator<A>>,
}

impl<A> MemoizeOptions<A> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            key_generator: None,
        }
    }

    pub fn with_key_generator<G>(mut self, generator: G) -> Self
    where
        G: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }
}

impl<A> Default for MemoizeOptions<A> {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 100)
    }
}

impl<A> Clone for MemoizeOptions<A> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            max_entries: self.max_entries,
            key_generator: self.key_generator.clone(),
        }
    }
}

impl<A> fmt::Debug for MemoizeOptions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizeOptions")
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

/// Maintenance hooks the manager holds for every memo map it hands out
pub(crate) trait MemoMaintenance: Send + Sync {
    /// Drop stale results, returning how many went
    fn cleanup(&self) -> usize;
    fn clear(&self);
}

struct MemoEntry<A, R> {
    args: A,
    result: R,
    stored_at: u64,
}

/// Bounded map of computed results
pub(crate) struct MemoStore<A, R> {
    entries: Mutex<HashMap<String, MemoEntry<A, R>>>,
    ttl: Duration,
    max_entries: usize,
    clock: SharedClock,
}

impl<A, R> MemoStore<A, R> {
    fn new(ttl: Duration, max_entries: usize, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            clock,
        }
    }

    fn is_fresh(&self, entry: &MemoEntry<A, R>, now: u64) -> bool {
        now.saturating_sub(entry.stored_at) <= self.ttl.as_millis() as u64
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<A, R> MemoMaintenance for MemoStore<A, R>
where
    A: Send + Sync,
    R: Send + Sync,
{
    fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl = self.ttl.as_millis() as u64;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.saturating_sub(e.stored_at) <= ttl);
        before - entries.len()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// A memoized async function
pub struct Memoized<A, R, F> {
    name: String,
    func: F,
    store: Arc<MemoStore<A, R>>,
    key_generator: Option<KeyGenerator<A>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<A, R, F, Fut> Memoized<A, R, F>
where
    A: Serialize + PartialEq + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    pub(crate) fn new(
        name: impl Into<String>,
        func: F,
        options: MemoizeOptions<A>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            func,
            store: Arc::new(MemoStore::new(options.ttl, options.max_entries, clock)),
            key_generator: options.key_generator,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn maintenance(&self) -> Arc<dyn MemoMaintenance> {
        self.store.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key under which `args` is memoized
    pub fn key_for(&self, args: &A) -> String {
        match &self.key_generator {
            Some(generate) => generate(args),
            None => CacheKeys::computed(&self.name, args).build(),
        }
    }

    /// Return the stored result for `args` when fresh, otherwise compute it
    ///
    /// Errors from the function are returned and not stored.
    pub async fn call(&self, args: A) -> Result<R> {
        let key = self.key_for(&args);
        let now = self.store.clock.now_millis();

        let cached = {
            let entries = self.store.entries.lock();
            entries
                .get(&key)
                .filter(|e| self.store.is_fresh(e, now) && e.args == args)
                .map(|e| e.result.clone())
        };
        if let Some(result) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Memo HIT fn={}, key={}", self.name, key);
            return Ok(result);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Memo MISS fn={}, key={}", self.name, key);
        let result = (self.func)(args.clone()).await?;

        let now = self.store.clock.now_millis();
        let mut entries = self.store.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.store.max_entries {
            let ttl = self.store.ttl.as_millis() as u64;
            entries.retain(|_, e| now.saturating_sub(e.stored_at) <= ttl);
            if entries.len() >= self.store.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            MemoEntry {
                args,
                result: result.clone(),
                stored_at: now,
            },
        );
        Ok(result)
    }

    /// Results currently stored
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CacheError, ManualClock};
    use std::sync::atomic::AtomicUsize;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(0))
    }

    #[tokio::test]
    async fn test_reuses_fresh_result() {
        let clock = clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let square = Memoized::new(
            "square",
            move |n: u64| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CacheError>(n * n)
                }
            },
            MemoizeOptions::new(Duration::from_secs(10), 10),
            clock.clone(),
        );

        assert_eq!(square.call(4).await.unwrap(), 16);
        assert_eq!(square.call(4).await.unwrap(), 16);
        assert_eq!(square.call(5).await.unwrap(), 25);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(square.hits(), 1);

        clock.advance(Duration::from_secs(11));
        assert_eq!(square.call(4).await.unwrap(), 16);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_args_must_match_even_when_keys_collide() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let echo = Memoized::new(
            "echo",
            move |s: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CacheError>(s)
                }
            },
            MemoizeOptions::default().with_key_generator(|_: &String| "same".to_string()),
            clock(),
        );

        assert_eq!(echo.call("a".to_string()).await.unwrap(), "a");
        assert_eq!(echo.call("b".to_string()).await.unwrap(), "b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(echo.len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_and_errors_not_stored() {
        let clock = clock();
        let memo = Memoized::new(
            "checked",
            |n: i32| async move {
                if n < 0 {
                    Err(CacheError::FetchFailed {
                        key: n.to_string(),
                        reason: "negative".to_string(),
                    })
                } else {
                    Ok(n + 1)
                }
            },
            MemoizeOptions::new(Duration::from_secs(60), 2),
            clock.clone(),
        );

        assert!(memo.call(-1).await.is_err());
        assert!(memo.is_empty());

        memo.call(1).await.unwrap();
        clock.advance(Duration::from_millis(1));
        memo.call(2).await.unwrap();
        clock.advance(Duration::from_millis(1));
        memo.call(3).await.unwrap();
        assert_eq!(memo.len(), 2);

        // Oldest result was dropped
        memo.call(1).await.unwrap();
        assert_eq!(memo.misses(), 5);
    }

    #[tokio::test]
    async fn test_default_key_uses_computed_prefix() {
        let memo = Memoized::new(
            "lookup",
            |n: u8| async move { Ok::<_, CacheError>(n) },
            MemoizeOptions::default(),
            clock(),
        );
        assert!(memo.key_for(&7).starts_with("compute:lookup:"));
    }

    #[tokio::test]
    async fn test_maintenance_cleanup() {
        let clock = clock();
        let memo = Memoized::new(
            "id",
            |n: u8| async move { Ok::<_, CacheError>(n) },
            MemoizeOptions::new(Duration::from_secs(1), 10),
            clock.clone(),
        );
        memo.call(1).await.unwrap();
        memo.call(2).await.unwrap();

        let handle = memo.maintenance();
        clock.advance(Duration::from_secs(2));
        assert_eq!(handle.cleanup(), 2);
        assert!(memo.is_empty());
    }
}
