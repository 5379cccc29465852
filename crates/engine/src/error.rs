//! Error types for the pipeline engine.
//!
//! `EngineError` is shared by the orchestration core and the HTTP surface;
//! it implements `IntoResponse` so handlers can return it directly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Plan failed structural or registration validation.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Malformed request (bad interrupt target, bad payload, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Write-once entry already present (sweeping outputs, tasks).
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// No declared facilitator applies to the node.
    #[error("No facilitator applicable for node {0}")]
    NoFacilitator(String),

    /// Strategy type is not supported by the expander.
    #[error("Strategy not supported: {0}")]
    StrategyNotSupported(String),

    /// Conflicting state (e.g. interrupt against a terminal target).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persistence backend error. Treated as transient.
    #[error("Store error: {0}")]
    Store(String),

    /// Transient errors kept recurring past the retry budget.
    #[error("Persistence retries exhausted: {0}")]
    PersistenceExhausted(String),

    /// Task could not be handed to the executor transport.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// NATS messaging error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::Nats(_) | EngineError::Dispatch(_))
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            EngineError::InvalidPlan(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            EngineError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            EngineError::AlreadyExists(msg) | EngineError::Conflict(msg) => {
                (StatusCode::CONFLICT, msg.clone())
            }
            EngineError::NoFacilitator(_) | EngineError::StrategyNotSupported(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            EngineError::Store(msg) | EngineError::PersistenceExhausted(msg) => {
                tracing::error!(error = %msg, "Store error");
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            EngineError::Dispatch(msg) | EngineError::Nats(msg) => {
                tracing::error!(error = %msg, "Messaging error");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            EngineError::Template(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            EngineError::Config(msg) | EngineError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::InvalidPlan(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<minijinja::Error> for EngineError {
    fn from(err: minijinja::Error) -> Self {
        EngineError::Template(err.to_string())
    }
}
