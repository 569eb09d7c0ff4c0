use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed agent output: {0}")]
    Protocol(String),

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The consumer stopped listening.
    #[error("event stream closed")]
    Closed,
}
