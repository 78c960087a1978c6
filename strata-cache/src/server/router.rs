use super::handlers::{self, AppState};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Operational surface
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/metrics/prometheus", get(handlers::prometheus_metrics))
        .route("/metrics/reset", post(handlers::reset_metrics))
        .route("/summary", get(handlers::summary))
        .route("/cleanup", post(handlers::cleanup))
        .route("/clear", post(handlers::clear))
        // Cache entries
        .route(
            "/cache/{key}",
            get(handlers::cache_get)
                .put(handlers::cache_set)
                .delete(handlers::cache_delete),
        )
        // Sessions
        .route(
            "/sessions",
            get(handlers::session_list).post(handlers::session_create),
        )
        .route(
            "/sessions/{id}",
            get(handlers::session_get).delete(handlers::session_delete),
        )
        .route("/sessions/{id}/extend", post(handlers::session_extend))
        .route("/sessions/{id}/renew", post(handlers::session_renew))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
