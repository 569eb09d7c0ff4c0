//! Shared API plumbing: the error type and blocking database access.

use axum::{
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use crate::storage::StorageError;
use parlance_db::DbPool;
use parlance_history::HistoryError;
use parlance_lock::LockError;
use parlance_types::TypeError;
use rusqlite::Connection;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalServerError(msg) => {
                tracing::error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<HistoryError> for ApiError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::NotFound(what) => ApiError::NotFound(what),
            HistoryError::InvalidTurn(msg) | HistoryError::InvalidInput(msg) => {
                ApiError::BadRequest(msg)
            }
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy(session) => {
                ApiError::Conflict(format!("session {session} is already generating"))
            }
            LockError::Backend(msg) => ApiError::InternalServerError(msg),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::InternalServerError(e.to_string())
    }
}

/// Validates a path or body identifier, naming the field on failure.
pub(crate) fn check_id(field: &str, id: &str) -> Result<(), ApiError> {
    parlance_types::validate_id(id)
        .map_err(|e: TypeError| ApiError::BadRequest(format!("{field}: {e}")))
}

/// Runs `op` on a pooled connection off the async runtime.
pub(crate) async fn with_conn<T, F>(pool: &DbPool, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, ApiError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        op(&mut *conn)
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))?
}
