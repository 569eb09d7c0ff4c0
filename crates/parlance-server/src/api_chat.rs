//! Chat endpoints: streamed completions, history listing and truncation.

use crate::api::{check_id, with_conn, ApiError};
use crate::storage::input_key;
use crate::turn::{self, Turn};
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    response::sse::{Event, KeepAlive, Sse},
};
use base64::Engine;
use futures_util::Stream;
use parlance_agent::{AgentRequest, OPTION_WORKING_DIR};
use parlance_history::SessionProfile;
use parlance_lock::LockGuard;
use parlance_types::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Events buffered between the turn task and the response body.
const EVENT_BUFFER: usize = 64;

/// Container assumed for recorded input when the request names none.
const DEFAULT_INPUT_FORMAT: &str = "webm";

/// How the `content` of a completion request is to be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Text,
    /// Base64 recording, transcribed before the turn starts.
    Audio,
}

/// Request body for `POST /api/chats/{sessionId}/completions`.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    /// Client-assigned id of the new human message.
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: InputKind,
    pub content: String,
    /// Container of an audio `content`, e.g. `webm` or `mp3`.
    #[serde(default)]
    pub format: Option<String>,
    /// Continue from this message instead of the latest one.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Turn options passed through to the agent.
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// A stored message with its audio link resolved.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default)]
    pub audio_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TruncateResponse {
    pub deleted: Vec<String>,
}

/// Handler for `POST /api/chats/{sessionId}/completions`.
///
/// Validation, the session lookup and the lock happen before the stream
/// opens, so a busy session is answered with `409` rather than an event.
pub async fn completions_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(mut payload): Json<CompletionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    check_id("session_id", &session_id)?;
    check_id("id", &payload.id)?;
    if let Some(parent) = &payload.parent_id {
        check_id("parent_id", parent)?;
    }
    if payload.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }

    let profile = {
        let sid = session_id.clone();
        with_conn(&state.pool, move |conn| {
            Ok(parlance_history::get_session_profile(conn, &sid)?)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id} is not bound")))?
    };

    let mut input_audio = None;
    if payload.kind == InputKind::Audio {
        let (key, transcript) = transcribe_input(&state, &payload).await?;
        tracing::info!(thread_id = %session_id, message_id = %payload.id, key = %key, "voice input transcribed");
        payload.content = transcript;
        input_audio = Some(key);
    }

    let guard = state.locks.acquire(&session_id).await?;

    let turn = match prepare_turn(&state, &session_id, profile, payload, input_audio).await {
        Ok(turn) => turn,
        Err(e) => {
            release(guard, &session_id).await;
            return Err(e);
        }
    };

    tracing::info!(
        thread_id = %session_id,
        message_id = %turn.human.id,
        context = turn.request.messages.len() - 1,
        "turn started"
    );

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(turn::run_turn(state.as_ref().clone(), turn, guard, tx));

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

fn check_format(format: &str) -> Result<(), ApiError> {
    let valid = !format.is_empty()
        && format.len() <= 8
        && format.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid {
        return Err(ApiError::BadRequest(format!("unsupported audio format {format:?}")));
    }
    Ok(())
}

/// Stores the recorded input and returns its key with the transcript.
async fn transcribe_input(
    state: &AppState,
    payload: &CompletionRequest,
) -> Result<(String, String), ApiError> {
    let format = payload
        .format
        .as_deref()
        .unwrap_or(DEFAULT_INPUT_FORMAT)
        .to_ascii_lowercase();
    check_format(&format)?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.content.trim())
        .map_err(|e| ApiError::BadRequest(format!("audio content is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("audio content is empty".to_string()));
    }

    let message_id = payload.id.clone();
    let exists = with_conn(&state.pool, move |conn| {
        Ok(parlance_history::get_message(conn, &message_id)?.is_some())
    })
    .await?;
    if exists {
        return Err(ApiError::Conflict(format!("message {} already exists", payload.id)));
    }

    let key = input_key(&payload.id, &format);
    state
        .storage
        .put(&key, bytes, &format!("audio/{format}"))
        .await?;
    let url = state.storage.get_url(&key).await?;

    let transcript = state
        .recognizer
        .transcribe(&url, &format)
        .await
        .map_err(|e| {
            tracing::warn!(message_id = %payload.id, error = %e, "speech recognition failed");
            ApiError::InternalServerError(e.to_string())
        })?;
    let transcript = transcript.trim().to_string();
    if transcript.is_empty() {
        return Err(ApiError::BadRequest("no speech recognized in audio".to_string()));
    }
    Ok((key, transcript))
}

/// Loads the context and assembles the agent request.
async fn prepare_turn(
    state: &AppState,
    session_id: &str,
    profile: SessionProfile,
    payload: CompletionRequest,
    input_audio: Option<String>,
) -> Result<Turn, ApiError> {
    let assistant = profile.assistant;
    let window_size = assistant.window_size;

    let context = {
        let thread = session_id.to_string();
        let message_id = payload.id.clone();
        let anchor = payload.parent_id.clone();
        with_conn(&state.pool, move |conn| {
            if parlance_history::get_message(conn, &message_id)?.is_some() {
                return Err(ApiError::Conflict(format!(
                    "message {message_id} already exists"
                )));
            }
            let context = match anchor {
                Some(anchor) => {
                    let mut lineage = parlance_history::chain(conn, &thread, &anchor)?;
                    let excess = lineage.len().saturating_sub(window_size as usize);
                    lineage.drain(..excess);
                    lineage
                }
                None => parlance_history::window(conn, &thread, window_size)?,
            };
            Ok(context)
        })
        .await?
    };
    let context = parlance_history::trim_orphan_tool_results(context);

    let parent = payload
        .parent_id
        .or_else(|| context.last().map(|m| m.id.clone()));
    let mut human = Message::human(payload.id, payload.content).with_parent(parent);
    human.thread_id = session_id.to_string();
    human.audio_key = input_audio;

    let mut options = payload.options;
    if let Some(dir) = &assistant.base_file_path {
        options
            .entry(OPTION_WORKING_DIR)
            .or_insert_with(|| Value::String(dir.clone()));
    }

    let mut messages = context;
    messages.push(human.clone());

    Ok(Turn {
        thread_id: session_id.to_string(),
        human,
        voice: assistant.voice_options(state.stream.encoding),
        request: AgentRequest {
            model: Some(assistant.model_name),
            system_prompt: Some(assistant.prompt_text).filter(|p| !p.is_empty()),
            messages,
            options,
        },
    })
}

async fn release(guard: LockGuard, session_id: &str) {
    if let Err(e) = guard.release().await {
        tracing::warn!(thread_id = session_id, error = %e, "failed to release session lock");
    }
}

/// Handler for `GET /api/chats/{sessionId}/messages`.
///
/// Returns the latest messages, oldest first, with audio links.
pub async fn list_messages_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<MessagesResponse>, ApiError> {
    check_id("session_id", &session_id)?;

    let limit = state.stream.history_limit;
    let messages = with_conn(&state.pool, move |conn| {
        Ok(parlance_history::window(conn, &session_id, limit)?)
    })
    .await?;

    let mut views = Vec::with_capacity(messages.len());
    for message in messages {
        let audio_url = match &message.audio_key {
            Some(key) => match state.storage.get_url(key).await {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::warn!(message_id = %message.id, key = %key, error = %e, "failed to resolve audio url");
                    None
                }
            },
            None => None,
        };
        views.push(MessageView { message, audio_url });
    }

    Ok(Json(MessagesResponse { messages: views }))
}

/// Handler for `DELETE /api/chats/{sessionId}/messages/{messageId}`.
///
/// Logically deletes the message and everything after it, typically before
/// regenerating from an earlier point.
pub async fn truncate_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((session_id, message_id)): Path<(String, String)>,
) -> Result<Json<TruncateResponse>, ApiError> {
    check_id("session_id", &session_id)?;
    check_id("message_id", &message_id)?;

    let guard = state.locks.acquire(&session_id).await?;

    let result = {
        let session_id = session_id.clone();
        with_conn(&state.pool, move |conn| {
            let ids = parlance_history::tail_ids_from(conn, &session_id, &message_id)?;
            if ids.is_empty() {
                return Err(ApiError::NotFound(format!("message {message_id}")));
            }
            parlance_history::logical_delete(conn, &ids)?;
            Ok(ids)
        })
        .await
    };
    release(guard, &session_id).await;

    let deleted = result?;
    tracing::info!(thread_id = %session_id, count = deleted.len(), "history truncated");
    Ok(Json(TruncateResponse { deleted }))
}
