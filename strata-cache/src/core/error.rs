use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Main error type for cache operations
///
/// Only `InvalidKey` and `InvalidConfig` are meant to reach callers of the
/// cache itself. Tier failures are recovered inside the tiered cache and only
/// surface here when a remote store reports them to its adapter.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Fetch failed for key {key}: {reason}")]
    FetchFailed { key: String, reason: String },

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CacheError {
    /// Shorthand for a remote tier failure
    pub fn unavailable(tier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier: tier.into(),
            reason: reason.into(),
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidKey(_) | Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::TierUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::FetchFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::SerializationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<prometheus::Error> for CacheError {
    fn from(err: prometheus::Error) -> Self {
        Self::InternalError(format!("metrics registry: {}", err))
    }
}

/// Implement IntoResponse for Axum integration
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
