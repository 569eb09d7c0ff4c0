//! Shared domain types for the parlance workspace.
//!
//! This crate holds the message model that flows between the agent, the
//! streaming pipeline and the history store, plus the voice options used by
//! speech synthesis. It has no I/O of its own; every other crate depends on it
//! for cross-cutting definitions so the dependency graph stays acyclic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod voice;

pub use voice::{AudioEncoding, VoiceOptions};

/// Maximum length of a message or conversation identifier.
pub const MAX_ID_LEN: usize = 64;

/// Errors produced while validating or parsing shared types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("identifier must not be empty")]
    EmptyId,
    #[error("identifier exceeds 64 characters")]
    IdTooLong,
    #[error("identifier contains invalid character {0:?}")]
    InvalidIdChar(char),
    #[error("unknown message role: {0}")]
    UnknownRole(String),
}

/// Author of a message within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person talking to the assistant. Opens every turn.
    Human,
    /// Output of the agent's generation step.
    Ai,
    /// Result of a tool invocation requested by an `Ai` message.
    Tool,
    /// Instructions injected by the platform.
    System,
}

impl Role {
    /// Returns the canonical lowercase label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Ai => "ai",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "ai" => Ok(Self::Ai),
            "tool" => Ok(Self::Tool),
            "system" => Ok(Self::System),
            other => Err(TypeError::UnknownRole(other.to_string())),
        }
    }
}

/// A tool invocation requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier referenced by the matching `Tool` message.
    pub id: String,
    /// Name of the tool.
    pub name: String,
    /// Arguments as produced by the model.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A single entry of a conversation's message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique message identifier.
    pub id: String,
    /// Conversation the message belongs to. Empty until the turn assigns it.
    #[serde(default)]
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    /// Tool calls emitted by an `Ai` message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Side product of a tool run (file listing, generated code, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Tool name for `Tool` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// For `Tool` messages, the id of the `ToolCall` this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Previous message in the lineage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Storage key of the synthesized speech clip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_key: Option<String>,
    /// Arrival sequence assigned on commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Message {
    fn with_role(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: String::new(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            artifact: None,
            name: None,
            tool_call_id: None,
            parent_id: None,
            audio_key: None,
            seq: None,
            deleted: false,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn human(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_role(id, Role::Human, content)
    }

    pub fn ai(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_role(id, Role::Ai, content)
    }

    pub fn system(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_role(id, Role::System, content)
    }

    /// Builds a tool result answering `tool_call_id`.
    pub fn tool(
        id: impl Into<String>,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_role(id, Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(name.into());
        msg
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Validates a client- or agent-supplied identifier.
///
/// Identifiers are limited to ASCII alphanumerics, `-` and `_` and at most
/// [`MAX_ID_LEN`] characters.
pub fn validate_id(id: &str) -> Result<(), TypeError> {
    if id.is_empty() {
        return Err(TypeError::EmptyId);
    }
    if id.chars().count() > MAX_ID_LEN {
        return Err(TypeError::IdTooLong);
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(TypeError::InvalidIdChar(bad));
    }
    Ok(())
}
