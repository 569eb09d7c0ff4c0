//! Error types for history operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// The batch violates the turn shape (one human message followed by
    /// ai/tool messages, tool results answering earlier calls).
    #[error("invalid turn: {0}")]
    InvalidTurn(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
