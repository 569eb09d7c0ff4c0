//! Wire encoding of turn events.
//!
//! Every event is a named SSE frame with a JSON payload:
//!
//! | event     | payload                                              |
//! |-----------|------------------------------------------------------|
//! | `start`   | `{"message": "stream start"}`                        |
//! | `message` | `{"chunk": {"type": <role>, "data": {...}}}`         |
//! | `audio`   | `{"base64": <clip bytes, base64>}`                   |
//! | `error`   | `{"message": "Internal server error occurred."}`     |
//! | `done`    | `{"message": "DONE"}`                                |

use axum::response::sse::Event;
use base64::Engine;
use parlance_types::{Message, Role, ToolCall};
use serde::Serialize;

pub const EVENT_START: &str = "start";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_AUDIO: &str = "audio";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_DONE: &str = "done";

/// Client-facing text of the `error` event. Details stay in the logs.
pub const ERROR_MESSAGE: &str = "Internal server error occurred.";

/// One event of a turn, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Start,
    Message(Message),
    Audio(Vec<u8>),
    Error,
    Done,
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => EVENT_START,
            Self::Message(_) => EVENT_MESSAGE,
            Self::Audio(_) => EVENT_AUDIO,
            Self::Error => EVENT_ERROR,
            Self::Done => EVENT_DONE,
        }
    }
}

#[derive(Serialize)]
struct Notice<'a> {
    message: &'a str,
}

#[derive(Serialize)]
struct AudioPayload {
    base64: String,
}

#[derive(Serialize)]
struct MessagePayload<'a> {
    chunk: Chunk<'a>,
}

#[derive(Serialize)]
struct Chunk<'a> {
    #[serde(rename = "type")]
    role: Role,
    data: ChunkData<'a>,
}

#[derive(Serialize)]
struct ChunkData<'a> {
    id: &'a str,
    content: &'a str,
    tool_calls: &'a [ToolCall],
    tool_call_id: Option<&'a str>,
    name: Option<&'a str>,
    tts_key: Option<&'a str>,
}

impl<'a> From<&'a Message> for MessagePayload<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            chunk: Chunk {
                role: message.role,
                data: ChunkData {
                    id: &message.id,
                    content: &message.content,
                    tool_calls: &message.tool_calls,
                    tool_call_id: message.tool_call_id.as_deref(),
                    name: message.name.as_deref(),
                    tts_key: message.audio_key.as_deref(),
                },
            },
        }
    }
}

/// Serializes the payload of `event`.
pub fn payload(event: &TurnEvent) -> Result<String, serde_json::Error> {
    match event {
        TurnEvent::Start => serde_json::to_string(&Notice {
            message: "stream start",
        }),
        TurnEvent::Message(message) => serde_json::to_string(&MessagePayload::from(message)),
        TurnEvent::Audio(bytes) => serde_json::to_string(&AudioPayload {
            base64: base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
        TurnEvent::Error => serde_json::to_string(&Notice {
            message: ERROR_MESSAGE,
        }),
        TurnEvent::Done => serde_json::to_string(&Notice { message: "DONE" }),
    }
}

/// Encodes `event` as an SSE frame.
pub fn encode(event: &TurnEvent) -> Result<Event, serde_json::Error> {
    Ok(Event::default().event(event.name()).data(payload(event)?))
}

/// Pre-rendered `error` frame; usable when encoding itself fails.
pub fn error_frame() -> Event {
    Event::default()
        .event(EVENT_ERROR)
        .data(r#"{"message":"Internal server error occurred."}"#)
}

pub fn done_frame() -> Event {
    Event::default().event(EVENT_DONE).data(r#"{"message":"DONE"}"#)
}
