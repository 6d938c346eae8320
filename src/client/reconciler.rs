// src/client/reconciler.rs

//! Merges a run snapshot with the change stream for that run.
//!
//! Notifications that arrive before the snapshot has been applied and the
//! stabilization window has passed are buffered. [`Reconciler::go_live`]
//! replays the buffer against the snapshot state, dropping whatever the
//! snapshot already implies, and from then on notifications are applied as
//! they arrive. Everything happens under one lock, so a run's updates are
//! applied strictly one after another.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::client::run::FlowRun;
use crate::errors::{PgflowError, Result};
use crate::state::RunSnapshot;
use crate::store::ChangeNotification;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Buffering,
    Live,
}

struct State {
    phase: Phase,
    buffer: Vec<ChangeNotification>,
    run: Option<FlowRun>,
}

pub struct Reconciler {
    run_id: Uuid,
    default_wait: Duration,
    state: Mutex<State>,
}

impl Reconciler {
    pub fn new(run_id: Uuid, default_wait: Duration) -> Self {
        Self {
            run_id,
            default_wait,
            state: Mutex::new(State {
                phase: Phase::Buffering,
                buffer: Vec::new(),
                run: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn buffered(&self) -> usize {
        self.state().buffer.len()
    }

    /// The observed run, once a snapshot has been applied.
    pub fn run(&self) -> Option<FlowRun> {
        self.state().run.clone()
    }

    /// Buffer or apply one notification. Returns whether it changed the
    /// local view (buffering counts as no change).
    pub fn handle(&self, notification: ChangeNotification) -> bool {
        if notification.run_id() != self.run_id {
            trace!(run_id = %self.run_id, other = %notification.run_id(), "ignoring notification for another run");
            return false;
        }
        let mut state = self.state();
        if state.phase == Phase::Live {
            if let Some(run) = state.run.clone() {
                return apply(&run, &notification);
            }
        }
        state.buffer.push(notification);
        false
    }

    /// Apply a snapshot. The first one becomes the initial state (no
    /// events); later ones bring the existing view forward.
    ///
    /// A snapshot that does not belong to this run is rejected before
    /// anything is applied.
    pub fn apply_snapshot(&self, snapshot: RunSnapshot) -> Result<FlowRun> {
        validate(self.run_id, &snapshot)?;
        let mut state = self.state();
        if let Some(run) = state.run.clone() {
            let changed = run.refresh(&snapshot);
            debug!(run_id = %self.run_id, changed, "refreshed from snapshot");
            return Ok(run);
        }
        let run = FlowRun::from_snapshot(snapshot, self.default_wait);
        state.run = Some(run.clone());
        Ok(run)
    }

    /// Replay buffered notifications and switch to live application.
    /// Returns how many buffered notifications changed the view.
    pub fn go_live(&self) -> Result<usize> {
        let mut state = self.state();
        let Some(run) = state.run.clone() else {
            return Err(PgflowError::Subscription(format!(
                "run {} has no snapshot to reconcile against",
                self.run_id
            )));
        };
        let buffered = std::mem::take(&mut state.buffer);
        let total = buffered.len();
        let applied = buffered.iter().filter(|n| apply(&run, n)).count();
        state.phase = Phase::Live;
        debug!(run_id = %self.run_id, total, applied, "reconciler live");
        Ok(applied)
    }
}

fn apply(run: &FlowRun, notification: &ChangeNotification) -> bool {
    match notification {
        ChangeNotification::RunUpdated(row) => run.apply_run_row(row),
        ChangeNotification::StepStateInserted(row) | ChangeNotification::StepStateUpdated(row) => {
            run.apply_step_row(row)
        }
        ChangeNotification::StepTaskInserted(row) => run.apply_task_row(row, true),
        ChangeNotification::StepTaskUpdated(row) => run.apply_task_row(row, false),
    }
}

fn validate(run_id: Uuid, snapshot: &RunSnapshot) -> Result<()> {
    let malformed = |reason: String| Err(PgflowError::MalformedSnapshot(reason));

    if snapshot.run.run_id != run_id {
        return malformed(format!(
            "snapshot is for run {}, expected {run_id}",
            snapshot.run.run_id
        ));
    }
    if let Some(step) = snapshot.steps.iter().find(|s| s.run_id != run_id) {
        return malformed(format!("step '{}' belongs to run {}", step.step_slug, step.run_id));
    }
    for task in &snapshot.tasks {
        if task.run_id != run_id {
            return malformed(format!(
                "task {}[{}] belongs to run {}",
                task.step_slug, task.task_index, task.run_id
            ));
        }
        if snapshot.step(&task.step_slug).is_none() {
            return malformed(format!(
                "task {}[{}] has no step state",
                task.step_slug, task.task_index
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::events::StepEventKind;
    use crate::flow::StepType;
    use crate::state::{RunRow, RunStatus, StepStateRow, StepStatus, StepTaskRow, TaskStatus};
    use chrono::Utc;
    use serde_json::json;

    fn run_row(run_id: Uuid, status: RunStatus, remaining: u32) -> RunRow {
        RunRow {
            run_id,
            flow_slug: "f".into(),
            status,
            input: json!({}),
            output: None,
            error_message: None,
            remaining_steps: remaining,
            started_at: Some(Utc::now()),
            completed_at: None,
            failed_at: None,
        }
    }

    fn step_row(run_id: Uuid, slug: &str, status: StepStatus) -> StepStateRow {
        StepStateRow {
            run_id,
            flow_slug: "f".into(),
            step_slug: slug.into(),
            step_type: StepType::Single,
            status,
            remaining_deps: 0,
            remaining_tasks: Some(1),
            initial_tasks: Some(1),
            output: None,
            error_message: None,
            skip_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            skipped_at: None,
        }
    }

    fn task_row(run_id: Uuid, slug: &str, status: TaskStatus, attempts: u32) -> StepTaskRow {
        StepTaskRow {
            run_id,
            flow_slug: "f".into(),
            step_slug: slug.into(),
            task_index: 0,
            status,
            attempts_count: attempts,
            output: None,
            error_message: None,
            message_id: Some(1),
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    fn snapshot(run_id: Uuid) -> RunSnapshot {
        RunSnapshot {
            run: run_row(run_id, RunStatus::Started, 2),
            steps: vec![
                step_row(run_id, "a", StepStatus::Started),
                step_row(run_id, "b", StepStatus::Created),
            ],
            tasks: vec![task_row(run_id, "a", TaskStatus::Queued, 0)],
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn buffered_notifications_already_in_the_snapshot_are_dropped() {
        let run_id = Uuid::new_v4();
        let rec = Reconciler::new(run_id, WAIT);

        // Delivered before the snapshot was read.
        rec.handle(ChangeNotification::RunUpdated(run_row(run_id, RunStatus::Started, 2)));
        rec.handle(ChangeNotification::StepStateUpdated(step_row(run_id, "a", StepStatus::Started)));
        rec.handle(ChangeNotification::StepTaskInserted(task_row(run_id, "a", TaskStatus::Queued, 0)));
        assert_eq!(rec.buffered(), 3);
        assert_eq!(rec.phase(), Phase::Buffering);

        let run = rec.apply_snapshot(snapshot(run_id)).unwrap();
        let mut events = run.subscribe_steps();
        assert_eq!(rec.go_live().unwrap(), 0);
        assert_eq!(rec.phase(), Phase::Live);
        assert!(events.drain().is_empty());
    }

    #[test]
    fn stale_and_duplicate_updates_never_regress_state() {
        let run_id = Uuid::new_v4();
        let rec = Reconciler::new(run_id, WAIT);
        let run = rec.apply_snapshot(snapshot(run_id)).unwrap();
        rec.go_live().unwrap();
        let mut started = run.subscribe_steps_to([StepEventKind::Started]);
        let mut all = run.subscribe_steps();

        let mut done = step_row(run_id, "a", StepStatus::Completed);
        done.output = Some(json!(1));
        assert!(rec.handle(ChangeNotification::StepStateUpdated(done.clone())));
        assert!(!rec.handle(ChangeNotification::StepStateUpdated(done)));
        assert!(!rec.handle(ChangeNotification::StepStateUpdated(step_row(run_id, "a", StepStatus::Started))));

        assert!(rec.handle(ChangeNotification::StepStateUpdated(step_row(run_id, "b", StepStatus::Started))));
        assert!(rec.handle(ChangeNotification::StepStateUpdated(step_row(run_id, "b", StepStatus::Failed))));
        assert!(!rec.handle(ChangeNotification::StepStateUpdated(step_row(run_id, "b", StepStatus::Completed))));

        let step_a = run.step("a").unwrap();
        assert_eq!(step_a.status(), StepStatus::Completed);
        assert_eq!(step_a.output(), Some(json!(1)));
        assert_eq!(run.step("b").unwrap().status(), StepStatus::Failed);

        let kinds: Vec<_> = all.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, ["step:completed", "step:started", "step:failed"]);
        assert_eq!(started.drain().len(), 1);
    }

    #[test]
    fn same_status_rows_are_taken_only_on_counter_progress() {
        let run_id = Uuid::new_v4();
        let rec = Reconciler::new(run_id, WAIT);
        let mut snap = snapshot(run_id);
        let started_at = Utc::now();
        snap.steps[0].remaining_tasks = Some(3);
        snap.steps[0].started_at = Some(started_at);
        let run = rec.apply_snapshot(snap).unwrap();
        rec.go_live().unwrap();

        let mut stale = step_row(run_id, "a", StepStatus::Started);
        stale.remaining_tasks = Some(3);
        stale.started_at = None;
        assert!(!rec.handle(ChangeNotification::StepStateUpdated(stale.clone())));
        stale.remaining_tasks = Some(4);
        assert!(!rec.handle(ChangeNotification::StepStateUpdated(stale)));
        assert_eq!(run.step("a").unwrap().row().started_at, Some(started_at));

        let mut newer = step_row(run_id, "a", StepStatus::Started);
        newer.remaining_tasks = Some(2);
        newer.started_at = Some(started_at);
        assert!(rec.handle(ChangeNotification::StepStateUpdated(newer)));
        assert_eq!(run.step("a").unwrap().row().remaining_tasks, Some(2));
    }

    #[test]
    fn task_rows_are_versioned_by_attempts() {
        let run_id = Uuid::new_v4();
        let rec = Reconciler::new(run_id, WAIT);
        let run = rec.apply_snapshot(snapshot(run_id)).unwrap();
        rec.go_live().unwrap();

        assert!(rec.handle(ChangeNotification::StepTaskUpdated(task_row(run_id, "a", TaskStatus::Started, 0))));
        // Requeued after a failure: lower status rank but more attempts.
        assert!(rec.handle(ChangeNotification::StepTaskUpdated(task_row(run_id, "a", TaskStatus::Queued, 1))));
        // A late claim notification from the first attempt.
        assert!(!rec.handle(ChangeNotification::StepTaskUpdated(task_row(run_id, "a", TaskStatus::Started, 0))));
        // Duplicate insert.
        assert!(!rec.handle(ChangeNotification::StepTaskInserted(task_row(run_id, "a", TaskStatus::Queued, 0))));

        let tasks = run.tasks("a");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].attempts_count, 1);
        assert_eq!(tasks[0].status, TaskStatus::Queued);
    }

    #[test]
    fn run_counters_only_move_forward() {
        let run_id = Uuid::new_v4();
        let rec = Reconciler::new(run_id, WAIT);
        let run = rec.apply_snapshot(snapshot(run_id)).unwrap();
        rec.go_live().unwrap();

        assert!(rec.handle(ChangeNotification::RunUpdated(run_row(run_id, RunStatus::Started, 1))));
        assert!(!rec.handle(ChangeNotification::RunUpdated(run_row(run_id, RunStatus::Started, 2))));
        assert_eq!(run.remaining_steps(), 1);

        let mut events = run.subscribe();
        assert!(rec.handle(ChangeNotification::RunUpdated(run_row(run_id, RunStatus::Completed, 0))));
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(events.drain()[0].event_type(), "run:completed");
    }

    #[test]
    fn foreign_and_malformed_input_is_rejected() {
        let run_id = Uuid::new_v4();
        let rec = Reconciler::new(run_id, WAIT);

        let other = Uuid::new_v4();
        assert!(!rec.handle(ChangeNotification::RunUpdated(run_row(other, RunStatus::Started, 1))));
        assert_eq!(rec.buffered(), 0);

        assert!(matches!(
            rec.apply_snapshot(snapshot(other)),
            Err(PgflowError::MalformedSnapshot(_))
        ));
        let mut orphan = snapshot(run_id);
        orphan.tasks.push(task_row(run_id, "ghost", TaskStatus::Queued, 0));
        assert!(matches!(rec.apply_snapshot(orphan), Err(PgflowError::MalformedSnapshot(_))));

        assert!(rec.run().is_none());
        assert!(rec.go_live().is_err());
    }

    #[test]
    fn later_snapshots_emit_the_transitions_they_reveal() {
        let run_id = Uuid::new_v4();
        let rec = Reconciler::new(run_id, WAIT);
        let run = rec.apply_snapshot(snapshot(run_id)).unwrap();
        rec.go_live().unwrap();
        let mut steps = run.subscribe_steps();
        let mut runs = run.subscribe();

        let mut newer = snapshot(run_id);
        newer.run = run_row(run_id, RunStatus::Completed, 0);
        newer.steps = vec![
            step_row(run_id, "a", StepStatus::Completed),
            step_row(run_id, "b", StepStatus::Completed),
        ];
        rec.apply_snapshot(newer).unwrap();

        assert_eq!(steps.drain().len(), 2);
        assert_eq!(runs.drain().len(), 1);
    }
}
