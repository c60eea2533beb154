//! Error type for the HTTP layer.
//!
//! [`ApiError`] maps domain failures onto status codes and renders them as
//! `{"error": ..., "status": ...}` JSON bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lineage_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Well-formed request the run lifecycle does not allow.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound(msg) => Self::NotFound(msg),
            CoreError::Conflict(msg) => Self::Conflict(msg),
            CoreError::InvalidTransition(msg) => Self::Unprocessable(msg),
            CoreError::InvalidInput(msg) => Self::BadRequest(msg),
            CoreError::Transient(msg) => Self::Unavailable(msg),
            CoreError::Permanent(msg) => Self::Internal(msg),
        }
    }
}

impl From<db::DbError> for ApiError {
    fn from(e: db::DbError) -> Self {
        CoreError::from(e).into()
    }
}

impl From<actors::ActorError> for ApiError {
    fn from(e: actors::ActorError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(msg) => {
                tracing::error!("Request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
