//! Message history and session bindings.
//!
//! The message chain is append-only: a turn's messages are written in one
//! transaction after the turn completes, rows keep their arrival order
//! (`seq`) forever, and removal is logical (`deleted = 1`) so regenerated
//! tails stay auditable. Two read paths rebuild agent context:
//!
//! - [`window`] returns the newest non-deleted messages of a conversation.
//! - [`chain`] follows parent references from an anchor back to the root,
//!   used when resuming from a historical message instead of the tail.
//!
//! All functions take a plain `rusqlite::Connection`; callers run them on a
//! blocking thread with a pooled connection.

mod error;
mod messages;
mod sessions;

pub use error::HistoryError;
pub use messages::{
    chain, commit_turn, get_message, insert_messages, logical_delete, tail_ids_from,
    trim_orphan_tool_results, validate_turn, window, MAX_CHAIN_DEPTH,
};
pub use sessions::{
    bind_session, create_assistant, delete_assistant, get_assistant, get_session_profile,
    list_assistants, list_sessions, unbind_session, update_assistant, AssistantProfile,
    AssistantUpdate, NewAssistant, SessionProfile,
};
