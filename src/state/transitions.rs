// src/state/transitions.rs

//! Monotonic status rules shared by the store (authoritative writes) and the
//! client reconciler (derived state).
//!
//! Runs and steps move `created -> started -> terminal` and never leave a
//! terminal status. Tasks may go back to `queued` on retry, so their order is
//! keyed by `(attempts_count, rank)` instead of rank alone.

use std::fmt::{Debug, Display};

use crate::errors::{PgflowError, Result};
use crate::state::{RunStatus, StepStatus, StepTaskRow, TaskStatus};

/// A status with a monotonic rank.
pub trait Lifecycle: Copy + Eq + Debug + Display {
    const ENTITY: &'static str;

    fn rank(self) -> u8;

    fn is_terminal(self) -> bool;

    /// Whether being in `self` implies the entity went through `target`.
    fn passed(self, target: Self) -> bool {
        self.rank() > target.rank()
    }
}

impl Lifecycle for RunStatus {
    const ENTITY: &'static str = "run";

    fn rank(self) -> u8 {
        match self {
            RunStatus::Created => 0,
            RunStatus::Started => 1,
            RunStatus::Completed | RunStatus::Failed => 2,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl Lifecycle for StepStatus {
    const ENTITY: &'static str = "step";

    fn rank(self) -> u8 {
        match self {
            StepStatus::Created => 0,
            StepStatus::Started => 1,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => 2,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// A skip can happen before the step ever started.
    fn passed(self, target: Self) -> bool {
        self != StepStatus::Skipped && self.rank() > target.rank()
    }
}

impl Lifecycle for TaskStatus {
    const ENTITY: &'static str = "task";

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Started => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// True when `incoming` is news relative to `current`: a strictly later
/// status on a non-terminal entity.
pub fn supersedes<S: Lifecycle>(current: S, incoming: S) -> bool {
    !current.is_terminal() && incoming.rank() > current.rank()
}

/// Store-side guard for run and step writes.
pub fn check_transition<S: Lifecycle>(from: S, to: S) -> Result<()> {
    if supersedes(from, to) {
        Ok(())
    } else {
        Err(PgflowError::InvalidTransition {
            entity: S::ENTITY,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Store-side guard for task writes. Retries move `started -> queued`; a
/// claim whose visibility timeout lapsed may be claimed again.
pub fn check_task_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    use TaskStatus::*;
    let ok = matches!(
        (from, to),
        (Queued, Started)
            | (Started, Started)
            | (Started, Queued)
            | (Queued | Started, Completed)
            | (Queued | Started, Failed)
    );
    if ok {
        Ok(())
    } else {
        Err(PgflowError::InvalidTransition {
            entity: TaskStatus::ENTITY,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Version key for task rows; a row is newer iff its key is greater.
pub fn task_version(row: &StepTaskRow) -> (u32, u8) {
    (row.attempts_count, row.status.rank())
}

/// Where an entity stands relative to a status someone is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reach {
    /// At or past the target.
    Reached,
    /// May still get there.
    Pending,
    /// Settled in a different terminal status.
    Unreachable,
}

pub fn reach<S: Lifecycle>(current: S, target: S) -> Reach {
    if current == target || current.passed(target) {
        Reach::Reached
    } else if current.is_terminal() {
        Reach::Unreachable
    } else {
        Reach::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_never_regress() {
        assert!(supersedes(StepStatus::Created, StepStatus::Started));
        assert!(supersedes(StepStatus::Created, StepStatus::Completed));
        assert!(supersedes(StepStatus::Started, StepStatus::Skipped));
        assert!(!supersedes(StepStatus::Completed, StepStatus::Started));
        assert!(!supersedes(StepStatus::Completed, StepStatus::Failed));
        assert!(!supersedes(StepStatus::Started, StepStatus::Started));
        assert!(!supersedes(RunStatus::Failed, RunStatus::Completed));
    }

    #[test]
    fn store_guards() {
        assert!(check_transition(RunStatus::Created, RunStatus::Started).is_ok());
        let err = check_transition(RunStatus::Completed, RunStatus::Failed).unwrap_err();
        assert_eq!(err.to_string(), "Invalid run transition: completed -> failed");

        assert!(check_task_transition(TaskStatus::Started, TaskStatus::Queued).is_ok());
        assert!(check_task_transition(TaskStatus::Completed, TaskStatus::Queued).is_err());
        assert!(check_task_transition(TaskStatus::Failed, TaskStatus::Started).is_err());
    }

    #[test]
    fn reach_accepts_passed_statuses() {
        assert_eq!(reach(RunStatus::Completed, RunStatus::Started), Reach::Reached);
        assert_eq!(reach(RunStatus::Started, RunStatus::Started), Reach::Reached);
        assert_eq!(reach(RunStatus::Created, RunStatus::Completed), Reach::Pending);
        assert_eq!(reach(RunStatus::Failed, RunStatus::Completed), Reach::Unreachable);
        assert_eq!(reach(StepStatus::Skipped, StepStatus::Completed), Reach::Unreachable);
        assert_eq!(reach(StepStatus::Completed, StepStatus::Created), Reach::Reached);
    }

    #[test]
    fn skipped_steps_only_reach_skipped() {
        assert_eq!(reach(StepStatus::Skipped, StepStatus::Skipped), Reach::Reached);
        assert_eq!(reach(StepStatus::Skipped, StepStatus::Started), Reach::Unreachable);
        assert_eq!(reach(StepStatus::Skipped, StepStatus::Created), Reach::Unreachable);
        assert_eq!(reach(StepStatus::Skipped, StepStatus::Failed), Reach::Unreachable);
        assert_eq!(reach(StepStatus::Started, StepStatus::Skipped), Reach::Pending);
        assert_eq!(reach(StepStatus::Completed, StepStatus::Skipped), Reach::Unreachable);
    }
}
