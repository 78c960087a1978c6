//! REST API tests with real HTTP requests

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use strata_cache::{AppState, CacheConfig, CacheManager, RemoteBackend, create_router};
use tokio::net::TcpListener;

async fn spawn_test_server() -> String {
    let mut config = CacheConfig::default();
    config.remote.primary = RemoteBackend::Local;
    config.tiered.write_through = true;

    let manager = Arc::new(CacheManager::new(config).unwrap());
    let app = create_router(AppState { manager });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    url
}

#[tokio::test]
async fn test_health_endpoint() {
    let base = spawn_test_server().await;
    let res = Client::new()
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["service"], "strata");
    assert_eq!(body["report"]["status"], "healthy");
    assert_eq!(body["report"]["memory_roundtrip"], true);
}

#[tokio::test]
async fn test_cache_crud() {
    let base = spawn_test_server().await;
    let client = Client::new();

    let res = client
        .put(format!("{}/cache/img:42", base))
        .json(&json!({"value": {"w": 640, "h": 480}, "ttl": 60}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(format!("{}/cache/img:42", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["value"]["w"], 640);

    let res = client
        .delete(format!("{}/cache/img:42", base))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["deleted"], true);

    let res = client
        .get(format!("{}/cache/img:42", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_key_is_bad_request() {
    let base = spawn_test_server().await;
    let res = Client::new()
        .put(format!("{}/cache/bad%20key", base))
        .json(&json!({"value": 1}))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_clear_with_pattern() {
    let base = spawn_test_server().await;
    let client = Client::new();

    for key in ["user:1:a", "user:1:b", "user:2:a"] {
        client
            .put(format!("{}/cache/{}", base, key))
            .json(&json!({"value": key}))
            .send()
            .await
            .unwrap();
    }

    let res = client
        .post(format!("{}/clear?pattern=user:1:*", base))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    // Memory plus the primary remote
    assert_eq!(body["removed"], 4);

    let res = client
        .get(format!("{}/cache/user:2:a", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_session_lifecycle() {
    let base = spawn_test_server().await;
    let client = Client::new();

    let res = client
        .post(format!("{}/sessions", base))
        .json(&json!({"session_id": "web-1", "user_id": "u-5"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    client
        .put(format!("{}/cache/draft?session=web-1", base))
        .json(&json!({"value": "hello"}))
        .send()
        .await
        .unwrap();

    let body: Value = client
        .get(format!("{}/sessions/web-1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["metadata"]["user_id"], "u-5");
    assert_eq!(body["data"]["draft"], "hello");

    let res = client
        .post(format!("{}/sessions/web-1/extend", base))
        .json(&json!({"seconds": 120}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .delete(format!("{}/sessions/web-1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(format!("{}/sessions/web-1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoints() {
    let base = spawn_test_server().await;
    let client = Client::new();

    client
        .put(format!("{}/cache/k:1", base))
        .json(&json!({"value": 1}))
        .send()
        .await
        .unwrap();

    let body: Value = client
        .get(format!("{}/metrics", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["global"]["sets"], 1);

    let text = client
        .get(format!("{}/metrics/prometheus", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("strata_cache_operations_total"));

    let summary = client
        .get(format!("{}/summary", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(summary.contains("Health"));

    let res = client
        .post(format!("{}/cleanup", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("{}/metrics/reset", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = client
        .get(format!("{}/metrics", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["global"]["sets"], 0);
}
