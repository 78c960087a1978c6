//! End-to-end behaviour of the cache manager


use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strata_cache::{
    CacheConfig, CacheError, CacheKeys, CacheManager, CacheOptions, HealthStatus,
    MemoizeOptions, RemoteBackend, RemoteStore, TierKind, WarmEntry,
};
use test_helper::{test_cache, write_through_config};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Description {
    image_id: String,
    text: String,
}

#[tokio::test]
async fn test_cache_aside_fetches_once() {
    let t = test_cache(write_through_config());
    let calls = AtomicUsize::new(0);
    let key = CacheKeys::description("img123", "en").build();

    for _ in 0..3 {
        let desc: Description = t
            .manager
            .get_or_set(
                &key,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CacheError>(Description {
                        image_id: "img123".to_string(),
                        text: "a red bicycle".to_string(),
                    })
                },
                &CacheOptions::default().with_ttl(Duration::from_secs(600)),
            )
            .await
            .unwrap();
        assert_eq!(desc.text, "a red bicycle");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(t.primary.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_fetch_error_is_returned_and_not_cached() {
    let t = test_cache(write_through_config());

    let result: Result<String, CacheError> = t
        .manager
        .get_or_set(
            "phrase:hello",
            || async {
                Err(CacheError::FetchFailed {
                    key: "phrase:hello".to_string(),
                    reason: "translator down".to_string(),
                })
            },
            &CacheOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(CacheError::FetchFailed { .. })));
    assert!(
        !t.manager
            .has("phrase:hello", &CacheOptions::default())
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_invalid_keys_are_rejected() {
    let t = test_cache(CacheConfig::default());
    let opts = CacheOptions::default();

    let err = t.manager.set("has space", &1, &opts).await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidKey(_)));
    assert!(t.manager.get::<u32>("").await.is_err());
    assert!(t.manager.invalidate("bad pattern*").await.is_err());
}

#[tokio::test]
async fn test_invalidate_pattern_across_tiers() {
    let t = test_cache(write_through_config());
    let opts = CacheOptions::default();

    t.manager.set("img:123:desc", &"a", &opts).await.unwrap();
    t.manager.set("img:123:tags", &"b", &opts).await.unwrap();
    t.manager.set("img:456:desc", &"c", &opts).await.unwrap();

    let removed = t.manager.invalidate("img:123:*").await.unwrap();
    assert_eq!(removed, 6);

    assert_eq!(t.manager.get::<String>("img:123:desc").await.unwrap(), None);
    assert_eq!(
        t.manager.get::<String>("img:456:desc").await.unwrap(),
        Some("c".to_string())
    );
    assert_eq!(t.primary.len(), 1);
    assert_eq!(t.secondary.len(), 1);
}

#[tokio::test]
async fn test_concurrent_fetches_are_deduplicated() {
    let t = test_cache(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch = |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, CacheError>(json!({"score": 0.9}))
        }
    };

    let (a, b, c) = tokio::join!(
        t.manager.deduplicate("vec:abc", fetch(calls.clone()), None),
        t.manager.deduplicate("vec:abc", fetch(calls.clone()), None),
        t.manager.deduplicate("vec:abc", fetch(calls.clone()), None),
    );

    assert_eq!(a.unwrap(), json!({"score": 0.9}));
    assert_eq!(b.unwrap(), c.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(t.manager.deduplicator().shared_hits(), 2);

    // Past the window a new fetch runs
    t.clock.advance(Duration::from_secs(6));
    t.manager
        .deduplicate("vec:abc", fetch(calls.clone()), None)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_memoized_function_and_cleanup() {
    let t = test_cache(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let word_count = t.manager.memoize(
        "word_count",
        move |text: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(text.split_whitespace().count())
            }
        },
        Some(MemoizeOptions::new(Duration::from_secs(30), 10)),
    );

    assert_eq!(word_count.call("a b c".to_string()).await.unwrap(), 3);
    assert_eq!(word_count.call("a b c".to_string()).await.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    t.clock.advance(Duration::from_secs(31));
    let report = t.manager.cleanup();
    assert_eq!(report.memoized_results, 1);
    assert!(word_count.is_empty());
}

#[tokio::test]
async fn test_warm_tolerates_failures() {
    let t = test_cache(write_through_config());

    let report = t
        .manager
        .warm(vec![
            WarmEntry::new("user:1:prefs", async { Ok(json!({"theme": "dark"})) }),
            WarmEntry::new("user:2:prefs", async {
                Err(CacheError::FetchFailed {
                    key: "user:2:prefs".to_string(),
                    reason: "timeout".to_string(),
                })
            }),
            WarmEntry::new("not valid", async { Ok(json!(null)) }),
        ])
        .await;

    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed.len(), 2);
    assert!(t.primary.exists("user:1:prefs").await.unwrap());
}

#[tokio::test]
async fn test_session_scoped_values() {
    let t = test_cache(CacheConfig::default());
    let scoped = CacheOptions::default().in_session("sess-1");

    t.manager
        .sessions()
        .create_session("sess-1", Some("user-9"), None);
    t.manager.set("cart", &json!(["apple"]), &scoped).await.unwrap();

    assert_eq!(t.manager.sessions().get_session_keys("sess-1"), vec!["cart"]);
    assert_eq!(
        t.manager.get_with::<Vec<String>>("cart", &scoped).await.unwrap(),
        Some(vec!["apple".to_string()])
    );

    assert!(t.manager.delete("cart", &scoped).await.unwrap());
    assert!(t.manager.sessions().get_session_keys("sess-1").is_empty());
}

#[tokio::test]
async fn test_session_values_stay_private() {
    let t = test_cache(write_through_config());
    let s1 = CacheOptions::default().in_session("s1");
    let s2 = CacheOptions::default().in_session("s2");

    t.manager
        .set("user:cart", &json!(["s1-secret"]), &s1)
        .await
        .unwrap();

    assert_eq!(t.manager.get_value("user:cart", &s2).await.unwrap(), None);
    assert_eq!(
        t.manager
            .get_value("user:cart", &CacheOptions::default())
            .await
            .unwrap(),
        None
    );
    assert!(!t.manager.has("user:cart", &s2).await.unwrap());
    assert!(!t.primary.exists("user:cart").await.unwrap());
    assert_eq!(
        t.manager.get_value("user:cart", &s1).await.unwrap(),
        Some(json!(["s1-secret"]))
    );

    // Nothing survives the session elsewhere
    assert!(t.manager.sessions().clear_session("s1"));
    assert_eq!(t.manager.get_value("user:cart", &s1).await.unwrap(), None);
}

#[tokio::test]
async fn test_clear_restores_health() {
    let t = test_cache(CacheConfig::default());
    for i in 0..11 {
        t.manager.metrics().record_error(
            Some(TierKind::RemotePrimary),
            "get",
            &format!("k:{}", i),
            "connection refused",
        );
    }
    assert_eq!(t.manager.health_check().await.status, HealthStatus::Unhealthy);

    // Probing and sweeping alone do not forget past errors
    t.manager.tiered().probe_health().await;
    t.manager.cleanup();
    assert_eq!(t.manager.health_check().await.status, HealthStatus::Unhealthy);

    t.manager.clear().await;
    let report = t.manager.health_check().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(t.manager.get_metrics().recent_errors.is_empty());

    for _ in 0..11 {
        t.manager.metrics().record_error(None, "fetch", "k:1", "timeout");
    }
    t.manager.reset_metrics();
    assert_eq!(t.manager.health_check().await.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_health_check_on_full_memory_tier() {
    let mut config = CacheConfig::default();
    config.memory.max_entries = 2;
    let t = test_cache(config);
    let opts = CacheOptions::default();

    t.manager.set("a:1", &1, &opts).await.unwrap();
    t.manager.set("a:2", &2, &opts).await.unwrap();
    let before = t.manager.tiered().memory().stats();

    for _ in 0..3 {
        assert!(t.manager.health_check().await.memory_roundtrip);
    }

    let memory = t.manager.tiered().memory();
    assert_eq!(memory.keys(None), vec!["a:1", "a:2"]);
    let after = memory.stats();
    assert_eq!(after.evictions, before.evictions);
    assert_eq!(after.hits, before.hits);
}

#[tokio::test]
async fn test_configured_local_backends() {
    let mut config = CacheConfig::default();
    config.remote.primary = RemoteBackend::Local;
    let manager = CacheManager::new(config).unwrap();

    assert!(manager.tiered().remote(TierKind::RemotePrimary).is_some());
    assert!(manager.tiered().remote(TierKind::RemoteSecondary).is_none());

    let report = manager.health_check().await;
    assert!(report.memory_roundtrip);
    assert_eq!(report.tiers.len(), 4);
}

#[tokio::test]
async fn test_metrics_and_summary() {
    let t = test_cache(write_through_config());
    let opts = CacheOptions::default();

    t.manager.set("k:1", &1, &opts).await.unwrap();
    t.manager.get::<u32>("k:1").await.unwrap();
    t.manager.get::<u32>("k:missing").await.unwrap();

    let snapshot = t.manager.get_metrics();
    assert_eq!(snapshot.global.sets, 1);
    assert_eq!(snapshot.global.gets, 2);
    assert_eq!(snapshot.global.hits, 1);
    assert_eq!(snapshot.global.misses, 1);

    assert!(t.manager.get_summary().contains("Cache Summary"));
    let text = t.manager.encode_prometheus().unwrap();
    assert!(text.contains("strata_cache_operations_total"));
}

#[tokio::test]
async fn test_clear_empties_everything() {
    let t = test_cache(write_through_config());
    let opts = CacheOptions::default();

    t.manager.set("a:1", &1, &opts).await.unwrap();
    t.manager.set("a:2", &2, &opts).await.unwrap();

    assert_eq!(t.manager.clear().await, 6);
    assert!(t.primary.is_empty());
    assert!(t.manager.tiered().memory().is_empty());
}
