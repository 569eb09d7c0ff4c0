//! Two-channel event delivery.
//!
//! Deltas and step updates travel on separate bounded channels so a burst of
//! deltas never queues behind an update (or the reverse). Every send is
//! stamped from one shared counter, and the merged stream yields whichever
//! queued head carries the lower stamp. Events already waiting on both
//! channels therefore come out in the order they were sent, and a delta sent
//! before its step's update always precedes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use parlance_types::Message;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::{AgentError, AgentEvent, AgentStream};

type Stamped<T> = (u64, T);

/// Producer half handed to the agent's worker tasks.
#[derive(Clone)]
pub struct EventSink {
    seq: Arc<AtomicU64>,
    deltas: mpsc::Sender<Stamped<AgentEvent>>,
    updates: mpsc::Sender<Stamped<Result<AgentEvent, AgentError>>>,
}

impl EventSink {
    fn stamp(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn delta(
        &self,
        step_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), AgentError> {
        let event = AgentEvent::TokenDelta {
            step_id: step_id.into(),
            text: text.into(),
        };
        self.deltas
            .send((self.stamp(), event))
            .await
            .map_err(|_| AgentError::Closed)
    }

    pub async fn step(
        &self,
        step_id: impl Into<String>,
        message: Message,
    ) -> Result<(), AgentError> {
        let event = AgentEvent::StepUpdate {
            step_id: step_id.into(),
            message,
        };
        self.updates
            .send((self.stamp(), Ok(event)))
            .await
            .map_err(|_| AgentError::Closed)
    }

    /// Reports a failure to the consumer. Ignored if it is already gone.
    pub async fn fail(&self, error: AgentError) {
        let _ = self.updates.send((self.stamp(), Err(error))).await;
    }

    pub fn is_closed(&self) -> bool {
        self.deltas.is_closed() || self.updates.is_closed()
    }
}

struct Merge {
    deltas: mpsc::Receiver<Stamped<AgentEvent>>,
    updates: mpsc::Receiver<Stamped<Result<AgentEvent, AgentError>>>,
    next_delta: Option<Stamped<AgentEvent>>,
    next_update: Option<Stamped<Result<AgentEvent, AgentError>>>,
    deltas_open: bool,
    updates_open: bool,
}

impl Merge {
    /// Moves whatever is already queued into the empty head slots.
    fn fill(&mut self) {
        if self.next_delta.is_none() && self.deltas_open {
            match self.deltas.try_recv() {
                Ok(event) => self.next_delta = Some(event),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.deltas_open = false,
            }
        }
        if self.next_update.is_none() && self.updates_open {
            match self.updates.try_recv() {
                Ok(update) => self.next_update = Some(update),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.updates_open = false,
            }
        }
    }

    async fn next(&mut self) -> Option<Result<AgentEvent, AgentError>> {
        loop {
            self.fill();
            match (self.next_delta.take(), self.next_update.take()) {
                (Some(delta), Some(update)) => {
                    if delta.0 < update.0 {
                        self.next_update = Some(update);
                        return Some(Ok(delta.1));
                    }
                    self.next_delta = Some(delta);
                    return Some(update.1);
                }
                // A delta sent before a queued update is itself queued by
                // then, so a lone head can go out without waiting.
                (Some(delta), None) => return Some(Ok(delta.1)),
                (None, Some(update)) => return Some(update.1),
                (None, None) => {
                    tokio::select! {
                        biased;
                        event = self.deltas.recv(), if self.deltas_open => match event {
                            Some(event) => self.next_delta = Some(event),
                            None => self.deltas_open = false,
                        },
                        update = self.updates.recv(), if self.updates_open => match update {
                            Some(update) => self.next_update = Some(update),
                            None => self.updates_open = false,
                        },
                        else => return None,
                    }
                }
            }
        }
    }
}

/// Creates a sink and the merged stream it feeds. The stream ends once every
/// clone of the sink is dropped.
pub fn event_channel(buffer: usize) -> (EventSink, AgentStream) {
    let (delta_tx, delta_rx) = mpsc::channel(buffer);
    let (update_tx, update_rx) = mpsc::channel(buffer);

    let state = Merge {
        deltas: delta_rx,
        updates: update_rx,
        next_delta: None,
        next_update: None,
        deltas_open: true,
        updates_open: true,
    };

    let merged = stream::unfold(state, |mut st| async move {
        let event = st.next().await?;
        Some((event, st))
    });

    let sink = EventSink {
        seq: Arc::new(AtomicU64::new(0)),
        deltas: delta_tx,
        updates: update_tx,
    };
    (sink, merged.boxed())
}
