use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::SessionMetadata;
use crate::core::{CacheError, CacheOptions, HealthStatus};
use crate::manager::{CacheManager, CleanupReport, HealthReport};
use crate::metrics::MetricsSnapshot;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CacheManager>,
}

/// `?session=` scope shared by the cache endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub session: Option<String>,
}

impl ScopeQuery {
    fn options(&self) -> CacheOptions {
        CacheOptions {
            session_id: self.session.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetRequest {
    pub value: Value,
    /// Seconds
    pub ttl: Option<u64>,
    pub priority: Option<u8>,
    pub write_through: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SetResponse {
    pub success: bool,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct GetResponse {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Seconds
    pub ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendSessionRequest {
    pub seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub metadata: SessionMetadata,
    pub data: HashMap<String, Value>,
}

/// Health report; unhealthy maps to 503
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report: HealthReport = state.manager.health_check().await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (
        status,
        Json(json!({
            "service": "strata",
            "version": env!("CARGO_PKG_VERSION"),
            "report": report,
        })),
    )
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.manager.get_metrics())
}

/// Prometheus text exposition
pub async fn prometheus_metrics(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, CacheError> {
    let body = state.manager.encode_prometheus()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

pub async fn reset_metrics(State(state): State<AppState>) -> Json<Value> {
    state.manager.reset_metrics();
    Json(json!({ "reset": true }))
}

pub async fn summary(State(state): State<AppState>) -> String {
    state.manager.get_summary()
}

pub async fn cleanup(State(state): State<AppState>) -> Json<CleanupReport> {
    Json(state.manager.cleanup())
}

/// Clear everything, or the keys matching `?pattern=`
pub async fn clear(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, CacheError> {
    let removed = match params.get("pattern") {
        Some(pattern) => state.manager.invalidate(pattern).await?,
        None => state.manager.clear().await,
    };
    Ok(Json(json!({ "removed": removed })))
}

pub async fn cache_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(scope): Query<ScopeQuery>,
) -> Result<impl IntoResponse, CacheError> {
    debug!("REST GET key={}, session={:?}", key, scope.session);

    Ok(match state.manager.get_value(&key, &scope.options()).await? {
        Some(value) => (StatusCode::OK, Json(json!(GetResponse { key, value }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Key not found", "key": key })),
        ),
    })
}

pub async fn cache_set(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(scope): Query<ScopeQuery>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>, CacheError> {
    debug!("REST SET key={}, ttl={:?}", key, req.ttl);

    let options = CacheOptions {
        ttl: req.ttl.map(Duration::from_secs),
        priority: req.priority,
        session_id: scope.session,
        write_through: req.write_through,
    };
    state.manager.set(&key, &req.value, &options).await?;

    Ok(Json(SetResponse { success: true, key }))
}

pub async fn cache_delete(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<Value>, CacheError> {
    debug!("REST DELETE key={}", key);
    let deleted = state.manager.delete(&key, &scope.options()).await?;
    Ok(Json(json!({ "deleted": deleted, "key": key })))
}

pub async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionMetadata>> {
    Json(state.manager.sessions().get_active_sessions())
}

/// Create a session; a missing id is generated
pub async fn session_create(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> (StatusCode, Json<SessionMetadata>) {
    let session_id = req
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let metadata = state.manager.sessions().create_session(
        &session_id,
        req.user_id.as_deref(),
        req.ttl.map(Duration::from_secs),
    );
    (StatusCode::CREATED, Json(metadata))
}

pub async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, CacheError> {
    let sessions = state.manager.sessions();
    let metadata = sessions
        .get_session(&id)
        .ok_or_else(|| CacheError::SessionNotFound(id.clone()))?;
    Ok(Json(SessionResponse {
        metadata,
        data: sessions.get_session_data(&id),
    }))
}

pub async fn session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, CacheError> {
    if state.manager.sessions().clear_session(&id) {
        Ok(Json(json!({ "cleared": true, "session_id": id })))
    } else {
        Err(CacheError::SessionNotFound(id))
    }
}

pub async fn session_extend(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExtendSessionRequest>,
) -> Result<Json<SessionMetadata>, CacheError> {
    let sessions = state.manager.sessions();
    if !sessions.extend_session(&id, Duration::from_secs(req.seconds)) {
        return Err(CacheError::SessionNotFound(id));
    }
    sessions
        .get_session(&id)
        .map(Json)
        .ok_or(CacheError::SessionNotFound(id))
}

pub async fn session_renew(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionMetadata>, CacheError> {
    let sessions = state.manager.sessions();
    if !sessions.renew_session(&id) {
        return Err(CacheError::SessionNotFound(id));
    }
    sessions
        .get_session(&id)
        .map(Json)
        .ok_or(CacheError::SessionNotFound(id))
}
