//! Service error type and HTTP response mapping.
//!
//! The compiler components (filter, planner, permissions) fail fast with a
//! typed error; handlers convert it to a JSON error body with the matching
//! status code.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced by the query pipeline and the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed filter, unresolvable property path, mismatched list lengths.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown resource or no row matching the requested key.
    #[error("not found: {0}")]
    NotFound(String),

    /// No authenticated principal where the resource requires one.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but no role rule grants the requested capability.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Business-rule violation (e.g. deleting a row that is still referenced).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Short machine-readable code, also used as the GraphQL error extension.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Database(_) | ApiError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        // Execution-level details stay in the log, not in the response body.
        let message = match &self {
            ApiError::Database(_) | ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": { "code": self.code(), "message": message }
        }));
        (status, body).into_response()
    }
}
