// src/client/events.rs

//! Typed transition events and the per-entity bus that carries them.
//!
//! Each entity owns a bus for a closed set of event kinds. Subscribers either
//! take everything or name the kinds they care about.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;
use uuid::Uuid;

use crate::state::{SkipReason, Timestamp};

/// Event types carried by an [`EventBus`].
pub trait BusEvent: Clone + Send + 'static {
    type Kind: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEventKind {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type")]
pub enum RunEvent {
    #[serde(rename = "run:started")]
    Started {
        run_id: Uuid,
        flow_slug: String,
        input: Value,
        started_at: Option<Timestamp>,
    },
    #[serde(rename = "run:completed")]
    Completed {
        run_id: Uuid,
        flow_slug: String,
        output: Option<Value>,
        completed_at: Option<Timestamp>,
    },
    #[serde(rename = "run:failed")]
    Failed {
        run_id: Uuid,
        flow_slug: String,
        error_message: Option<String>,
        failed_at: Option<Timestamp>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::Started { run_id, .. }
            | RunEvent::Completed { run_id, .. }
            | RunEvent::Failed { run_id, .. } => *run_id,
        }
    }

    /// `run:started`, `run:completed` or `run:failed`.
    pub fn event_type(&self) -> &'static str {
        match self.kind() {
            RunEventKind::Started => "run:started",
            RunEventKind::Completed => "run:completed",
            RunEventKind::Failed => "run:failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Started { .. })
    }
}

impl BusEvent for RunEvent {
    type Kind = RunEventKind;

    fn kind(&self) -> RunEventKind {
        match self {
            RunEvent::Started { .. } => RunEventKind::Started,
            RunEvent::Completed { .. } => RunEventKind::Completed,
            RunEvent::Failed { .. } => RunEventKind::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepEventKind {
    Started,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type")]
pub enum StepEvent {
    #[serde(rename = "step:started")]
    Started {
        run_id: Uuid,
        step_slug: String,
        started_at: Option<Timestamp>,
    },
    #[serde(rename = "step:completed")]
    Completed {
        run_id: Uuid,
        step_slug: String,
        output: Option<Value>,
        completed_at: Option<Timestamp>,
    },
    #[serde(rename = "step:failed")]
    Failed {
        run_id: Uuid,
        step_slug: String,
        error_message: Option<String>,
        failed_at: Option<Timestamp>,
    },
    #[serde(rename = "step:skipped")]
    Skipped {
        run_id: Uuid,
        step_slug: String,
        skip_reason: Option<SkipReason>,
        skipped_at: Option<Timestamp>,
    },
}

impl StepEvent {
    pub fn step_slug(&self) -> &str {
        match self {
            StepEvent::Started { step_slug, .. }
            | StepEvent::Completed { step_slug, .. }
            | StepEvent::Failed { step_slug, .. }
            | StepEvent::Skipped { step_slug, .. } => step_slug,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind() {
            StepEventKind::Started => "step:started",
            StepEventKind::Completed => "step:completed",
            StepEventKind::Failed => "step:failed",
            StepEventKind::Skipped => "step:skipped",
        }
    }
}

impl BusEvent for StepEvent {
    type Kind = StepEventKind;

    fn kind(&self) -> StepEventKind {
        match self {
            StepEvent::Started { .. } => StepEventKind::Started,
            StepEvent::Completed { .. } => StepEventKind::Completed,
            StepEvent::Failed { .. } => StepEventKind::Failed,
            StepEvent::Skipped { .. } => StepEventKind::Skipped,
        }
    }
}

pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Broadcast of one entity's events.
pub struct EventBus<E: BusEvent> {
    tx: broadcast::Sender<E>,
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver to current subscribers; events with no subscriber are dropped.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream<E> {
        EventStream {
            rx: self.tx.subscribe(),
            kinds: None,
        }
    }

    pub fn subscribe_to(&self, kinds: impl IntoIterator<Item = E::Kind>) -> EventStream<E> {
        EventStream {
            rx: self.tx.subscribe(),
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving end of an [`EventBus`] subscription. Dropping it unsubscribes.
pub struct EventStream<E: BusEvent> {
    rx: broadcast::Receiver<E>,
    kinds: Option<Vec<E::Kind>>,
}

impl<E: BusEvent> EventStream<E> {
    fn accepts(&self, event: &E) -> bool {
        self.kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&event.kind()))
    }

    /// Next matching event, or `None` once the entity is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber fell behind; events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event that is already buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber fell behind; events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Everything currently buffered that matches.
    pub fn drain(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
