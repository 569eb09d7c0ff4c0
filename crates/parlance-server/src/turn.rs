//! The turn pipeline.
//!
//! One task per completion request consumes the agent's event stream and
//! fans it out three ways: token deltas go through a per-step sentence
//! segmenter into the audio assembler, finished fragments go to the client
//! as `audio` events, and step updates become `message` events plus the
//! turn's pending history batch. The batch is committed in one transaction
//! once the agent finishes; any failure before that discards it.
//!
//! By default events are delivered as they happen, so a client may see
//! messages of a turn whose commit later fails. With
//! `deliver_after_commit` every event after `start` is held until the commit
//! succeeds.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Event;
use futures_util::StreamExt;
use parlance_agent::{AgentError, AgentEvent, AgentRequest, AgentStream};
use parlance_lock::LockGuard;
use parlance_types::{Message, Role, VoiceOptions};
use parlance_voice::{AudioAssembler, SentenceSegmenter};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sse::{self, TurnEvent};
use crate::storage::audio_key;
use crate::AppState;

const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// Sending half of a turn's SSE response.
pub type EventSender = mpsc::Sender<Result<Event, Infallible>>;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("agent failed: {0}")]
    Agent(#[from] AgentError),

    #[error("failed to persist turn: {0}")]
    Persistence(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("session lock lost: {0}")]
    LockLost(String),

    #[error("client disconnected")]
    Disconnected,
}

fn protocol(msg: impl Into<String>) -> TurnError {
    TurnError::Agent(AgentError::Protocol(msg.into()))
}

/// A turn ready to run: the lock is held and the context is loaded.
#[derive(Debug, Clone)]
pub struct Turn {
    pub thread_id: String,
    /// The new human message with its parent reference set.
    pub human: Message,
    pub request: AgentRequest,
    pub voice: VoiceOptions,
}

/// Client side of a turn. Holds events back while `held` is `Some`.
struct Outbox {
    tx: EventSender,
    held: Option<Vec<Event>>,
}

impl Outbox {
    fn new(tx: EventSender, hold: bool) -> Self {
        Self {
            tx,
            held: hold.then(Vec::new),
        }
    }

    async fn deliver(&self, frame: Event) -> Result<(), TurnError> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| TurnError::Disconnected)
    }

    async fn send(&mut self, event: TurnEvent) -> Result<(), TurnError> {
        let frame = sse::encode(&event)?;
        if let Some(held) = self.held.as_mut() {
            if self.tx.is_closed() {
                return Err(TurnError::Disconnected);
            }
            held.push(frame);
            return Ok(());
        }
        self.deliver(frame).await
    }

    /// Delivers everything held back so far and stops holding.
    async fn release(&mut self) -> Result<(), TurnError> {
        if let Some(held) = self.held.take() {
            for frame in held {
                self.deliver(frame).await?;
            }
        }
        Ok(())
    }

    /// Drops held events and tells the client the turn failed.
    async fn fail(&mut self) {
        self.held = None;
        if self.deliver(sse::error_frame()).await.is_ok() {
            let _ = self.deliver(sse::done_frame()).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Runs `turn` to completion and releases `guard`.
///
/// The lock is renewed while the turn runs; losing it aborts the turn.
/// Errors are reported to the client as `error` + `done` and logged; a
/// disconnected client gets nothing further. The lock is released before
/// the event channel closes, so a client that saw the end of the stream can
/// start the next turn immediately.
pub async fn run_turn(state: AppState, turn: Turn, guard: LockGuard, tx: EventSender) {
    let thread_id = turn.thread_id.clone();
    let mut outbox = Outbox::new(tx, state.stream.deliver_after_commit);

    let result = tokio::select! {
        result = drive(&state, turn, &mut outbox) => result,
        lost = keep_locked(&guard) => Err(lost),
    };

    match result {
        Ok(()) => tracing::info!(thread_id = %thread_id, "turn completed"),
        Err(TurnError::Disconnected) => {
            tracing::info!(thread_id = %thread_id, "client disconnected during turn");
        }
        Err(e) => {
            tracing::error!(thread_id = %thread_id, error = %e, "turn failed");
            outbox.fail().await;
        }
    }

    if let Err(e) = guard.release().await {
        tracing::warn!(thread_id = %thread_id, error = %e, "failed to release session lock");
    }
    drop(outbox);
}

/// Renews `guard` every third of its TTL. Returns only once the lock is gone.
async fn keep_locked(guard: &LockGuard) -> TurnError {
    let period = (guard.ttl() / 3).max(MIN_RENEW_PERIOD);
    loop {
        tokio::time::sleep(period).await;
        match guard.renew().await {
            Ok(true) => tracing::trace!(key = guard.key(), "session lock renewed"),
            Ok(false) => return TurnError::LockLost("expired or taken over".to_string()),
            Err(e) => return TurnError::LockLost(e.to_string()),
        }
    }
}

async fn drive(state: &AppState, turn: Turn, outbox: &mut Outbox) -> Result<(), TurnError> {
    outbox.deliver(sse::encode(&TurnEvent::Start)?).await?;

    let events = state.agent.invoke(turn.request).await?;
    let assembler = AudioAssembler::new(state.synthesizer.clone(), turn.voice);
    let mut mux = Multiplexer {
        state,
        thread_id: &turn.thread_id,
        segmenters: HashMap::new(),
        issued_calls: HashSet::new(),
        assembler,
        batch: vec![turn.human],
    };
    mux.run(events, outbox).await?;
    let batch = mux.batch;

    if outbox.is_closed() {
        return Err(TurnError::Disconnected);
    }
    commit(state, &turn.thread_id, batch).await?;

    outbox.release().await?;
    outbox.send(TurnEvent::Done).await
}

async fn commit(state: &AppState, thread_id: &str, batch: Vec<Message>) -> Result<(), TurnError> {
    let pool = state.pool.clone();
    let thread = thread_id.to_string();
    let count = batch.len();

    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| TurnError::Persistence(format!("db connection failed: {}", e)))?;
        parlance_history::commit_turn(&mut conn, &thread, &batch)
            .map_err(|e| TurnError::Persistence(e.to_string()))
    })
    .await
    .map_err(|e| TurnError::Persistence(format!("task join error: {}", e)))??;

    tracing::info!(thread_id, messages = count, "turn committed");
    Ok(())
}

/// Per-turn state of the event fan-out.
struct Multiplexer<'a> {
    state: &'a AppState,
    thread_id: &'a str,
    /// Open segmenters keyed by step id. A step's segmenter is removed by
    /// its update; a later delta under the same id starts a fresh one.
    segmenters: HashMap<String, SentenceSegmenter>,
    /// Tool call ids issued by AI messages of this turn.
    issued_calls: HashSet<String>,
    assembler: AudioAssembler,
    batch: Vec<Message>,
}

impl Multiplexer<'_> {
    async fn run(&mut self, mut events: AgentStream, outbox: &mut Outbox) -> Result<(), TurnError> {
        loop {
            tokio::select! {
                biased;
                _ = outbox.closed() => return Err(TurnError::Disconnected),
                Some(ready) = self.assembler.next_ready(), if self.assembler.has_pending() => {
                    outbox.send(TurnEvent::Audio(ready.audio)).await?;
                }
                event = events.next() => match event {
                    None => break,
                    Some(Err(e)) => return Err(TurnError::Agent(e)),
                    Some(Ok(AgentEvent::TokenDelta { step_id, text })) => {
                        self.on_delta(step_id, &text);
                    }
                    Some(Ok(AgentEvent::StepUpdate { step_id, message })) => {
                        self.on_step(&step_id, message, outbox).await?;
                    }
                },
            }
        }

        for (step_id, segmenter) in &self.segmenters {
            if !segmenter.is_empty() {
                tracing::warn!(
                    thread_id = self.thread_id,
                    step_id = %step_id,
                    "agent finished without finalizing step, text dropped"
                );
            }
        }
        self.assembler.discard();
        Ok(())
    }

    fn on_delta(&mut self, step_id: String, text: &str) {
        let config = self.state.stream.segmenter;
        let segmenter = self
            .segmenters
            .entry(step_id.clone())
            .or_insert_with(|| SentenceSegmenter::new(config));
        if let Some(fragment) = segmenter.feed(text) {
            tracing::trace!(thread_id = self.thread_id, step_id = %step_id, "fragment queued");
            self.assembler.feed(&step_id, fragment);
        }
    }

    async fn on_step(
        &mut self,
        step_id: &str,
        mut message: Message,
        outbox: &mut Outbox,
    ) -> Result<(), TurnError> {
        if let Some(rest) = self.segmenters.remove(step_id).and_then(|mut s| s.finish()) {
            self.assembler.feed(step_id, rest);
        }
        for ready in self.assembler.drain().await {
            outbox.send(TurnEvent::Audio(ready.audio)).await?;
        }
        let clip = self.assembler.finish_step(step_id);

        parlance_types::validate_id(&message.id)
            .map_err(|e| protocol(format!("message id {:?}: {e}", message.id)))?;
        if self.batch.iter().any(|m| m.id == message.id) {
            return Err(protocol(format!("duplicate message id {}", message.id)));
        }

        match message.role {
            Role::Ai => {
                if let Some(clip) = clip.filter(|_| !message.content.trim().is_empty()) {
                    message.audio_key = self.store_clip(&message.id, clip).await;
                }
                if message.has_tool_calls() {
                    self.issued_calls
                        .extend(message.tool_calls.iter().map(|c| c.id.clone()));
                    self.announce_tools(&message, outbox).await?;
                }
            }
            Role::Tool => {
                let answered = message
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| self.issued_calls.contains(id));
                if !answered {
                    return Err(protocol(format!(
                        "tool result {} answers no call issued in this turn",
                        message.id
                    )));
                }
            }
            Role::Human | Role::System => {
                return Err(protocol(format!(
                    "agent produced a {} message",
                    message.role
                )));
            }
        }

        message.thread_id = self.thread_id.to_string();
        message.parent_id = self.batch.last().map(|m| m.id.clone());
        message.seq = None;
        message.deleted = false;

        tracing::debug!(
            thread_id = self.thread_id,
            step_id,
            message_id = %message.id,
            role = %message.role,
            "step finalized"
        );
        outbox.send(TurnEvent::Message(message.clone())).await?;
        self.batch.push(message);
        Ok(())
    }

    /// Stores a finished clip. Failures are logged and leave the message
    /// without audio.
    async fn store_clip(&mut self, message_id: &str, clip: Vec<u8>) -> Option<String> {
        let encoding = self.assembler.voice().encoding;
        let key = audio_key(message_id, encoding);
        match self.state.storage.put(&key, clip, encoding.mime_type()).await {
            Ok(()) => Some(key),
            Err(e) => {
                tracing::warn!(
                    thread_id = self.thread_id,
                    message_id,
                    key = %key,
                    error = %e,
                    "failed to store audio clip"
                );
                None
            }
        }
    }

    /// Speaks the notice for the tools `message` is about to run.
    async fn announce_tools(&mut self, message: &Message, outbox: &mut Outbox) -> Result<(), TurnError> {
        let Some(text) = self.state.tool_prompts.for_calls(&message.tool_calls) else {
            return Ok(());
        };
        match self
            .state
            .synthesizer
            .synthesize(&text, self.assembler.voice())
            .await
        {
            Ok(audio) if !audio.is_empty() => outbox.send(TurnEvent::Audio(audio)).await,
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    thread_id = self.thread_id,
                    message_id = %message.id,
                    error = %e,
                    "tool notice synthesis failed"
                );
                Ok(())
            }
        }
    }
}
