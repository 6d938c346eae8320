// src/client/step.rs

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::events::{EventBus, EventStream, StepEvent, StepEventKind};
use crate::client::waiter::{wait_for_status, WaitOptions};
use crate::errors::Result;
use crate::state::{supersedes, Lifecycle, StepStateRow, StepStatus};

/// Client-side view of one step of an observed run.
#[derive(Clone)]
pub struct FlowStep {
    inner: Arc<StepInner>,
}

struct StepInner {
    run_id: Uuid,
    step_slug: String,
    row: Mutex<StepStateRow>,
    status: watch::Sender<StepStatus>,
    events: EventBus<StepEvent>,
    default_wait: Duration,
    disposed: CancellationToken,
}

impl fmt::Debug for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStep")
            .field("run_id", &self.inner.run_id)
            .field("step_slug", &self.inner.step_slug)
            .field("status", &self.status())
            .finish()
    }
}

impl FlowStep {
    pub(crate) fn new(row: StepStateRow, default_wait: Duration, disposed: CancellationToken) -> Self {
        let (status, _) = watch::channel(row.status);
        Self {
            inner: Arc::new(StepInner {
                run_id: row.run_id,
                step_slug: row.step_slug.clone(),
                row: Mutex::new(row),
                status,
                events: EventBus::default(),
                default_wait,
                disposed,
            }),
        }
    }

    fn row_lock(&self) -> MutexGuard<'_, StepStateRow> {
        self.inner.row.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn step_slug(&self) -> &str {
        &self.inner.step_slug
    }

    pub fn status(&self) -> StepStatus {
        *self.inner.status.borrow()
    }

    /// Latest known row.
    pub fn row(&self) -> StepStateRow {
        self.row_lock().clone()
    }

    pub fn output(&self) -> Option<Value> {
        self.row_lock().output.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.row_lock().error_message.clone()
    }

    pub fn subscribe(&self) -> EventStream<StepEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_to(&self, kinds: impl IntoIterator<Item = StepEventKind>) -> EventStream<StepEvent> {
        self.inner.events.subscribe_to(kinds)
    }

    /// Resolve once the step is at or past `target`.
    pub async fn wait_for_status(&self, target: StepStatus, options: WaitOptions) -> Result<FlowStep> {
        wait_for_status(
            self.inner.status.subscribe(),
            target,
            options,
            self.inner.default_wait,
            &self.inner.disposed,
        )
        .await?;
        Ok(self.clone())
    }

    /// Merge a newer row. Status only moves forward; rows with the current
    /// non-terminal status are taken only when a counter went down and none
    /// went back up.
    /// Returns the event for a status change.
    pub(crate) fn apply(&self, incoming: &StepStateRow) -> Option<StepEvent> {
        let mut row = self.row_lock();
        if supersedes(row.status, incoming.status) {
            *row = incoming.clone();
            drop(row);
            self.inner.status.send_replace(incoming.status);
            let event = event_for(incoming)?;
            self.inner.events.emit(event.clone());
            return Some(event);
        }
        if row.status == incoming.status
            && !row.status.is_terminal()
            && progressed(&row, incoming)
        {
            *row = incoming.clone();
        }
        None
    }
}

fn progressed(current: &StepStateRow, incoming: &StepStateRow) -> bool {
    let tasks = match (incoming.remaining_tasks, current.remaining_tasks) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    };
    let deps = incoming.remaining_deps.cmp(&current.remaining_deps);
    tasks.is_le() && deps.is_le() && (tasks.is_lt() || deps.is_lt())
}

fn event_for(row: &StepStateRow) -> Option<StepEvent> {
    let run_id = row.run_id;
    let step_slug = row.step_slug.clone();
    Some(match row.status {
        StepStatus::Created => return None,
        StepStatus::Started => StepEvent::Started {
            run_id,
            step_slug,
            started_at: row.started_at,
        },
        StepStatus::Completed => StepEvent::Completed {
            run_id,
            step_slug,
            output: row.output.clone(),
            completed_at: row.completed_at,
        },
        StepStatus::Failed => StepEvent::Failed {
            run_id,
            step_slug,
            error_message: row.error_message.clone(),
            failed_at: row.failed_at,
        },
        StepStatus::Skipped => StepEvent::Skipped {
            run_id,
            step_slug,
            skip_reason: row.skip_reason,
            skipped_at: row.skipped_at,
        },
    })
}
