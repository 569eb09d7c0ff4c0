//! Single-step agent backed by an OpenAI-compatible chat completions API.
//!
//! Each invocation streams one generation: content deltas become token
//! deltas of step `generate`, and the accumulated text (plus any tool calls
//! the model requested) becomes that step's update. Tools are not executed
//! here.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use parlance_types::{Message, Role, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{event_channel, Agent, AgentConfig, AgentError, AgentRequest, AgentStream, EventSink};

const STEP_ID: &str = "generate";
const EVENT_BUFFER: usize = 64;

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

impl<'a> WireMessage<'a> {
    fn from_message(msg: &'a Message) -> Self {
        let role = match msg.role {
            Role::Human => "user",
            Role::Ai => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        };
        Self {
            role,
            content: &msg.content,
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    kind: "function",
                    function: WireFunction {
                        name: tc.name.clone(),
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: msg.tool_call_id.as_deref(),
            name: msg.name.as_deref(),
        }
    }

    fn system(content: &'a str) -> Self {
        Self {
            role: "system",
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Splits a byte stream into `data:` payloads of complete lines.
///
/// Bytes are buffered rather than decoded per chunk so multi-byte characters
/// split across network chunks survive.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

#[derive(Default)]
struct ToolCallDraft {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates one streamed generation.
#[derive(Default)]
struct Generation {
    content: String,
    tool_calls: BTreeMap<usize, ToolCallDraft>,
}

impl Generation {
    /// Applies one chunk and returns the new content, if any.
    fn apply(&mut self, chunk: ChatCompletionChunk) -> Option<String> {
        let mut text = String::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                text.push_str(&content);
            }
            for call in choice.delta.tool_calls {
                let draft = self.tool_calls.entry(call.index).or_default();
                if let Some(id) = call.id {
                    draft.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        draft.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        draft.arguments.push_str(&arguments);
                    }
                }
            }
        }
        self.content.push_str(&text);
        (!text.is_empty()).then_some(text)
    }

    fn into_message(self, id: String) -> Message {
        let calls = self
            .tool_calls
            .into_values()
            .map(|draft| ToolCall {
                id: draft.id,
                name: draft.name,
                arguments: serde_json::from_str(&draft.arguments)
                    .unwrap_or(Value::String(draft.arguments)),
            })
            .collect();
        Message::ai(id, self.content).with_tool_calls(calls)
    }
}

/// Streaming chat completions client.
#[derive(Debug, Clone)]
pub struct ChatCompletionsAgent {
    client: reqwest::Client,
    config: AgentConfig,
}

impl ChatCompletionsAgent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.base_url.is_empty() {
            return Err(AgentError::Config("agent base_url must not be empty".to_string()));
        }
        let timeout = Duration::from_secs(config.timeout_seconds);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl Agent for ChatCompletionsAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentStream, AgentError> {
        let model = request.model.as_deref().unwrap_or(&self.config.model);

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(WireMessage::system(prompt));
        }
        messages.extend(request.messages.iter().map(WireMessage::from_message));

        let body = ChatCompletionRequest {
            model,
            messages,
            stream: true,
        };

        let mut builder = self.client.post(self.chat_url()).json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(AgentError::Status { status, body });
        }

        tracing::debug!(model, context = request.messages.len(), "agent stream opened");

        let (sink, stream) = event_channel(EVENT_BUFFER);
        tokio::spawn(async move {
            if let Err(e) = pump(response, &sink).await {
                if !matches!(e, AgentError::Closed) {
                    tracing::warn!(error = %e, "agent stream failed");
                    sink.fail(e).await;
                }
            }
        });

        Ok(stream)
    }
}

async fn pump(response: reqwest::Response, sink: &EventSink) -> Result<(), AgentError> {
    let mut bytes = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut generation = Generation::default();
    let mut finished = false;

    'read: while let Some(chunk) = bytes.next().await {
        let chunk = chunk?;
        for payload in lines.push(&chunk) {
            if payload == "[DONE]" {
                finished = true;
                break 'read;
            }
            let parsed: ChatCompletionChunk = serde_json::from_str(&payload)
                .map_err(|e| AgentError::Protocol(format!("{e}: {payload}")))?;
            if let Some(text) = generation.apply(parsed) {
                sink.delta(STEP_ID, text).await?;
            }
        }
    }

    if !finished {
        return Err(AgentError::Protocol(
            "stream ended without [DONE]".to_string(),
        ));
    }

    let message = generation.into_message(uuid::Uuid::new_v4().to_string());
    sink.step(STEP_ID, message).await
}
