//! Error types for the server crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors raised while building the server or handling API requests.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] firepool_core::CoreError),

    /// VM manager construction or lifecycle failure.
    #[error("executor error: {0}")]
    Executor(#[from] firepool_executor::ExecutorError),

    /// CI provider client construction failure.
    #[error("provider error: {0}")]
    Provider(#[from] firepool_provider::ProviderError),

    /// The requested pool is not configured.
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    /// The request or configuration contains invalid values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::PoolNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}
