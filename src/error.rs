//! Error types for Agora
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Envelope problems (`InvalidActivity`, `UnknownVerb`) are raised before
/// dispatch. `NotFound` and `Forbidden` raised inside a verb handler are
/// caught by the dispatcher and attached to the activity instead of being
/// returned directly.
#[derive(Debug, Error)]
pub enum AppError {
    /// Activity envelope failed validation (400)
    #[error("Invalid activity: {}", .0.join("; "))]
    InvalidActivity(Vec<String>),

    /// No handler for the submitted verb (400)
    #[error("Unknown activity type: {0}")]
    UnknownVerb(String),

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Ownership, admin or membership check failed (403)
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Peer unreachable or rejected a request (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.into())
    }
}

impl AppError {
    /// HTTP status and metric label for this error
    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::InvalidActivity(_) => (StatusCode::BAD_REQUEST, "invalid_activity"),
            AppError::UnknownVerb(_) => (StatusCode::BAD_REQUEST, "unknown_verb"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::InvalidSignature => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Federation(_) => (StatusCode::BAD_GATEWAY, "federation"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "http_client"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }

    /// Message safe to show to API callers
    ///
    /// Storage and internal failures are not echoed verbatim.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body. Envelope validation failures return
    /// the full error list.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_type) = self.status_and_type();

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = match &self {
            AppError::InvalidActivity(errors) => Json(serde_json::json!({
                "valid": false,
                "errors": errors,
            })),
            _ => Json(serde_json::json!({
                "error": self.public_message(),
            })),
        };

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
