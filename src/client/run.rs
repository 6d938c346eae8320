// src/client/run.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::client::events::{EventBus, EventStream, RunEvent, RunEventKind, StepEvent, StepEventKind};
use crate::client::step::FlowStep;
use crate::client::waiter::{wait_for_status, WaitOptions};
use crate::errors::Result;
use crate::state::transitions::task_version;
use crate::state::{supersedes, Lifecycle, RunRow, RunSnapshot, RunStatus, StepStateRow, StepTaskRow, TaskKey};

/// Client-side view of one run: its row, its steps and their tasks.
///
/// Clones share state. All mutation goes through the run's reconciler.
#[derive(Clone)]
pub struct FlowRun {
    inner: Arc<RunInner>,
}

struct RunInner {
    run_id: Uuid,
    flow_slug: String,
    row: Mutex<RunRow>,
    status: watch::Sender<RunStatus>,
    events: EventBus<RunEvent>,
    step_events: EventBus<StepEvent>,
    steps: Mutex<BTreeMap<String, FlowStep>>,
    tasks: Mutex<BTreeMap<TaskKey, StepTaskRow>>,
    default_wait: Duration,
    disposed: CancellationToken,
}

impl fmt::Debug for FlowRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRun")
            .field("run_id", &self.inner.run_id)
            .field("flow_slug", &self.inner.flow_slug)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FlowRun {
    /// Initial state from a snapshot; publishes no events.
    pub(crate) fn from_snapshot(snapshot: RunSnapshot, default_wait: Duration) -> Self {
        let disposed = CancellationToken::new();
        let (status, _) = watch::channel(snapshot.run.status);
        let steps = snapshot
            .steps
            .into_iter()
            .map(|row| {
                (
                    row.step_slug.clone(),
                    FlowStep::new(row, default_wait, disposed.clone()),
                )
            })
            .collect();
        let tasks = snapshot.tasks.into_iter().map(|t| (t.key(), t)).collect();
        Self {
            inner: Arc::new(RunInner {
                run_id: snapshot.run.run_id,
                flow_slug: snapshot.run.flow_slug.clone(),
                row: Mutex::new(snapshot.run),
                status,
                events: EventBus::default(),
                step_events: EventBus::default(),
                steps: Mutex::new(steps),
                tasks: Mutex::new(tasks),
                default_wait,
                disposed,
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn flow_slug(&self) -> &str {
        &self.inner.flow_slug
    }

    pub fn status(&self) -> RunStatus {
        *self.inner.status.borrow()
    }

    pub fn row(&self) -> RunRow {
        locked(&self.inner.row).clone()
    }

    pub fn input(&self) -> Value {
        locked(&self.inner.row).input.clone()
    }

    pub fn output(&self) -> Option<Value> {
        locked(&self.inner.row).output.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        locked(&self.inner.row).error_message.clone()
    }

    pub fn remaining_steps(&self) -> u32 {
        locked(&self.inner.row).remaining_steps
    }

    pub fn step(&self, slug: &str) -> Option<FlowStep> {
        locked(&self.inner.steps).get(slug).cloned()
    }

    pub fn steps(&self) -> Vec<FlowStep> {
        locked(&self.inner.steps).values().cloned().collect()
    }

    /// Known tasks of a step, by task index.
    pub fn tasks(&self, step_slug: &str) -> Vec<StepTaskRow> {
        locked(&self.inner.tasks)
            .values()
            .filter(|t| t.step_slug == step_slug)
            .cloned()
            .collect()
    }

    /// The local view in snapshot form.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run: self.row(),
            steps: self.steps().iter().map(FlowStep::row).collect(),
            tasks: locked(&self.inner.tasks).values().cloned().collect(),
        }
    }

    pub fn subscribe(&self) -> EventStream<RunEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_to(&self, kinds: impl IntoIterator<Item = RunEventKind>) -> EventStream<RunEvent> {
        self.inner.events.subscribe_to(kinds)
    }

    /// Events of every step in the run.
    pub fn subscribe_steps(&self) -> EventStream<StepEvent> {
        self.inner.step_events.subscribe()
    }

    pub fn subscribe_steps_to(&self, kinds: impl IntoIterator<Item = StepEventKind>) -> EventStream<StepEvent> {
        self.inner.step_events.subscribe_to(kinds)
    }

    /// Resolve once the run is at or past `target`.
    pub async fn wait_for_status(&self, target: RunStatus, options: WaitOptions) -> Result<FlowRun> {
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

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    /// Ends pending waits on the run and its steps.
    pub(crate) fn dispose(&self) {
        self.inner.disposed.cancel();
    }

    /// Merge a run row. Returns whether anything changed.
    pub(crate) fn apply_run_row(&self, incoming: &RunRow) -> bool {
        let mut row = locked(&self.inner.row);
        if supersedes(row.status, incoming.status) {
            *row = incoming.clone();
            drop(row);
            self.inner.status.send_replace(incoming.status);
            if let Some(event) = run_event_for(incoming) {
                self.inner.events.emit(event);
            }
            return true;
        }
        // Same non-terminal status: only take progress (fewer remaining steps).
        if row.status == incoming.status
            && !row.status.is_terminal()
            && incoming.remaining_steps < row.remaining_steps
        {
            row.remaining_steps = incoming.remaining_steps;
            return true;
        }
        trace!(run_id = %self.inner.run_id, status = %incoming.status, "stale run row dropped");
        false
    }

    pub(crate) fn apply_step_row(&self, incoming: &StepStateRow) -> bool {
        let existing = locked(&self.inner.steps).get(&incoming.step_slug).cloned();
        let Some(step) = existing else {
            let step = FlowStep::new(incoming.clone(), self.inner.default_wait, self.inner.disposed.clone());
            locked(&self.inner.steps).insert(incoming.step_slug.clone(), step);
            return true;
        };
        let before = step.row();
        match step.apply(incoming) {
            Some(event) => {
                self.inner.step_events.emit(event);
                true
            }
            None => step.row() != before,
        }
    }

    /// Insert a task row, or replace the known one if `incoming` is newer.
    /// A repeated insert for a known task is a duplicate and is dropped.
    pub(crate) fn apply_task_row(&self, incoming: &StepTaskRow, inserted: bool) -> bool {
        let mut tasks = locked(&self.inner.tasks);
        let key = incoming.key();
        match tasks.get(&key) {
            None => {
                tasks.insert(key, incoming.clone());
                true
            }
            Some(_) if inserted => false,
            Some(current) if task_version(incoming) > task_version(current) => {
                tasks.insert(key, incoming.clone());
                true
            }
            Some(_) => false,
        }
    }

    /// Bring the local view up to a newer snapshot, emitting events for
    /// transitions it reveals. Tasks first, then steps, then the run, the
    /// same order the store commits them in.
    pub(crate) fn refresh(&self, snapshot: &RunSnapshot) -> usize {
        let mut changed = 0;
        for task in &snapshot.tasks {
            changed += usize::from(self.apply_task_row(task, false));
        }
        for step in &snapshot.steps {
            changed += usize::from(self.apply_step_row(step));
        }
        changed += usize::from(self.apply_run_row(&snapshot.run));
        changed
    }
}

fn run_event_for(row: &RunRow) -> Option<RunEvent> {
    let run_id = row.run_id;
    let flow_slug = row.flow_slug.clone();
    Some(match row.status {
        RunStatus::Created => return None,
        RunStatus::Started => RunEvent::Started {
            run_id,
            flow_slug,
            input: row.input.clone(),
            started_at: row.started_at,
        },
        RunStatus::Completed => RunEvent::Completed {
            run_id,
            flow_slug,
            output: row.output.clone(),
            completed_at: row.completed_at,
        },
        RunStatus::Failed => RunEvent::Failed {
            run_id,
            flow_slug,
            error_message: row.error_message.clone(),
            failed_at: row.failed_at,
        },
    })
}
