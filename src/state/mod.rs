// src/state/mod.rs

//! Persisted row shapes for runs, step states and step tasks, plus the
//! status rules in [`transitions`].
//!
//! These types travel in both directions: the store writes them and
//! publishes them in change notifications, the client reconciles them into
//! its local view.

pub mod transitions;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flow::StepType;

pub use transitions::{check_task_transition, check_transition, reach, supersedes, Lifecycle, Reach};

pub type Timestamp = DateTime<Utc>;

macro_rules! status_display {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Started,
    Completed,
    Failed,
}

status_display!(RunStatus {
    Created => "created",
    Started => "started",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Created,
    Started,
    Completed,
    Failed,
    Skipped,
}

status_display!(StepStatus {
    Created => "created",
    Started => "started",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

status_display!(TaskStatus {
    Queued => "queued",
    Started => "started",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ConditionUnmet,
    HandlerFailed,
    DependencySkipped,
}

status_display!(SkipReason {
    ConditionUnmet => "condition_unmet",
    HandlerFailed => "handler_failed",
    DependencySkipped => "dependency_skipped",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub remaining_steps: u32,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStateRow {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub step_slug: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub remaining_deps: u32,
    /// Unset until the step starts and its task count is known.
    pub remaining_tasks: Option<u32>,
    pub initial_tasks: Option<u32>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
    pub skipped_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTaskRow {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub step_slug: String,
    pub task_index: u32,
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempts_count: u32,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub message_id: Option<i64>,
    pub queued_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
}

impl StepTaskRow {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            step_slug: self.step_slug.clone(),
            task_index: self.task_index,
        }
    }
}

/// Identity of a task inside one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub step_slug: String,
    pub task_index: u32,
}

/// Everything known about a run at one point in time, read in one go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: RunRow,
    pub steps: Vec<StepStateRow>,
    pub tasks: Vec<StepTaskRow>,
}

impl RunSnapshot {
    pub fn step(&self, slug: &str) -> Option<&StepStateRow> {
        self.steps.iter().find(|s| s.step_slug == slug)
    }

    pub fn tasks_of<'a>(&'a self, slug: &'a str) -> impl Iterator<Item = &'a StepTaskRow> + 'a {
        self.tasks.iter().filter(move |t| t.step_slug == slug)
    }
}

/// A claimed task, as handed to a worker by a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTaskRecord {
    pub flow_slug: String,
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: u32,
    pub input: Value,
    pub message_id: i64,
    /// 1-based number of this execution attempt.
    pub attempt: u32,
    /// Status of the owning step when the claim was made.
    pub step_status: StepStatus,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl StepTaskRecord {
    pub fn key(&self) -> (Uuid, TaskKey) {
        (
            self.run_id,
            TaskKey {
                step_slug: self.step_slug.clone(),
                task_index: self.task_index,
            },
        )
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
