//! Request deduplication
//!
//! Concurrent or repeated calls for the same key inside a time window share a
//! single in-flight future. The owner of a future removes its registry entry
//! once the future has settled and the window has elapsed.

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::core::{Result, SharedClock};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

struct InFlight {
    id: u64,
    started_at: u64,
    window: Duration,
    future: Box<dyn Any + Send + Sync>,
}

impl InFlight {
    fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.started_at) < self.window.as_millis() as u64
    }
}

/// Registry of in-flight fetches keyed by cache key
#[derive(Clone)]
pub struct Deduplicator {
    inflight: Arc<Mutex<HashMap<String, InFlight>>>,
    next_id: Arc<AtomicU64>,
    executions: Arc<AtomicU64>,
    shared_hits: Arc<AtomicU64>,
    clock: SharedClock,
    default_window: Duration,
}

impl Deduplicator {
    pub fn new(default_window: Duration, clock: SharedClock) -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            executions: Arc::new(AtomicU64::new(0)),
            shared_hits: Arc::new(AtomicU64::new(0)),
            clock,
            default_window,
        }
    }

    pub fn default_window(&self) -> Duration {
        self.default_window
    }

    /// Run `fetcher` unless a fresh fetch for `key` is already registered,
    /// in which case its result is shared
    pub async fn run<T, F, Fut>(&self, key: &str, fetcher: F, window: Option<Duration>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let window = window.unwrap_or(self.default_window);
        let now = self.clock.now_millis();

        let (future, owner) = {
            let mut inflight = self.inflight.lock();
            let existing = inflight
                .get(key)
                .filter(|entry| entry.is_fresh(now))
                .and_then(|entry| entry.future.downcast_ref::<SharedFetch<T>>())
                .cloned();

            match existing {
                Some(future) => {
                    self.shared_hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Dedup JOIN key={}", key);
                    (future, None)
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future: SharedFetch<T> = fetcher().boxed().shared();
                    inflight.insert(
                        key.to_string(),
                        InFlight {
                            id,
                            started_at: now,
                            window,
                            future: Box::new(future.clone()),
                        },
                    );
                    self.executions.fetch_add(1, Ordering::Relaxed);
                    debug!("Dedup START key={}, window={:?}", key, window);
                    (future, Some(id))
                }
            }
        };

        let result = future.await;

        if let Some(id) = owner {
            let elapsed = self.clock.now_millis().saturating_sub(now);
            let remaining = window.saturating_sub(Duration::from_millis(elapsed));
            if remaining.is_zero() {
                self.remove_if_owner(key, id);
            } else {
                let registry = self.clone();
                let key = key.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    registry.remove_if_owner(&key, id);
                });
            }
        }

        result
    }

    fn remove_if_owner(&self, key: &str, id: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.get(key).is_some_and(|entry| entry.id == id) {
            inflight.remove(key);
        }
    }

    /// Drop registrations whose window has passed
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let mut inflight = self.inflight.lock();
        let before = inflight.len();
        inflight.retain(|_, entry| entry.is_fresh(now));
        before - inflight.len()
    }

    pub fn clear(&self) {
        self.inflight.lock().clear();
    }

    /// Registrations currently held
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetchers actually invoked
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Calls answered by an existing fetch
    pub fn shared_hits(&self) -> u64 {
        self.shared_hits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CacheError, ManualClock};
    use std::sync::atomic::AtomicUsize;

    fn dedup() -> (Deduplicator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (Deduplicator::new(Duration::from_secs(5), clock.clone()), clock)
    }

    fn counting_fetch(counter: &Arc<AtomicUsize>) -> impl Future<Output = Result<usize>> + Send + 'static {
        let counter = counter.clone();
        async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
    }

    #[tokio::test]
    async fn test_repeat_within_window_runs_once() {
        let (dedup, clock) = dedup();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = dedup.run("k", || counting_fetch(&counter), None).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let second = dedup.run("k", || counting_fetch(&counter), None).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.shared_hits(), 1);

        clock.advance(Duration::from_secs(5));
        let third = dedup.run("k", || counting_fetch(&counter), None).await.unwrap();
        assert_eq!(third, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let (dedup, _) = dedup();
        let counter = Arc::new(AtomicUsize::new(0));

        let slow = |counter: Arc<AtomicUsize>| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, CacheError>(counter.fetch_add(1, Ordering::SeqCst))
        };

        let (a, b, c) = tokio::join!(
            dedup.run("k", || slow(counter.clone()), None),
            dedup.run("k", || slow(counter.clone()), None),
            dedup.run("k", || slow(counter.clone()), None),
        );

        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (0, 0, 0));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.executions(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let (dedup, _) = dedup();
        let counter = Arc::new(AtomicUsize::new(0));

        dedup.run("a", || counting_fetch(&counter), None).await.unwrap();
        dedup.run("b", || counting_fetch(&counter), None).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_shared_too() {
        let (dedup, _) = dedup();
        let counter = Arc::new(AtomicUsize::new(0));

        let failing = |counter: Arc<AtomicUsize>| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<usize, _>(CacheError::FetchFailed {
                key: "k".to_string(),
                reason: "upstream down".to_string(),
            })
        };

        assert!(dedup.run("k", || failing(counter.clone()), None).await.is_err());
        assert!(dedup.run("k", || failing(counter.clone()), None).await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_removed_after_window() {
        let (dedup, clock) = dedup();
        let counter = Arc::new(AtomicUsize::new(0));

        dedup
            .run("k", || counting_fetch(&counter), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(dedup.len(), 1);

        // The owner's delayed removal runs on real time
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dedup.is_empty());

        dedup
            .run("k", || counting_fetch(&counter), None)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6));
        assert_eq!(dedup.cleanup(), 1);
    }
}
