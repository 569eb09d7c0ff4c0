//! Agent collaborator for streaming turns.
//!
//! An agent is invoked once per turn with the conversation context and turn
//! options, and answers with one stream carrying two kinds of events:
//!
//! - [`AgentEvent::TokenDelta`]: incremental text of a step still generating.
//! - [`AgentEvent::StepUpdate`]: the finalized message of a step.
//!
//! Agents that produce the two kinds on separate tasks feed them through an
//! [`EventSink`]; the receiving side merges both channels so that every delta
//! sent before a step's update is yielded before that update.

pub mod chat;
pub mod config;
pub mod error;
pub mod merge;

use futures_util::stream::BoxStream;
use parlance_types::Message;
use serde_json::{Map, Value};

pub use chat::ChatCompletionsAgent;
pub use config::AgentConfig;
pub use error::AgentError;
pub use merge::{event_channel, EventSink};

/// Turn option naming the working directory exposed to tools.
pub const OPTION_WORKING_DIR: &str = "working_dir";

/// One event of an agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TokenDelta { step_id: String, text: String },
    StepUpdate { step_id: String, message: Message },
}

impl AgentEvent {
    pub fn step_id(&self) -> &str {
        match self {
            Self::TokenDelta { step_id, .. } | Self::StepUpdate { step_id, .. } => step_id,
        }
    }
}

pub type AgentStream = BoxStream<'static, Result<AgentEvent, AgentError>>;

/// Input of one invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    /// Model override; agents fall back to their configured model.
    pub model: Option<String>,
    /// System prompt placed ahead of the context.
    pub system_prompt: Option<String>,
    /// Prior messages followed by the new human message.
    pub messages: Vec<Message>,
    /// Open turn-scoped configuration, e.g. [`OPTION_WORKING_DIR`].
    pub options: Map<String, Value>,
}

impl AgentRequest {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Starts a turn. Errors returned here happen before any event exists;
    /// later failures arrive as `Err` items on the stream.
    async fn invoke(&self, request: AgentRequest) -> Result<AgentStream, AgentError>;
}
