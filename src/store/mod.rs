// src/store/mod.rs

//! The persistence boundary.
//!
//! - [`SqlGateway`] is the only way workers and clients mutate or read
//!   persisted state.
//! - [`ChangeFeed`] delivers per-run change notifications.
//! - [`notifications`] holds the notification payloads and the per-run topic
//!   registry.
//! - [`memory`] is an in-process store implementing both traits.

pub mod memory;
pub mod notifications;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::errors::Result;
use crate::state::{RunRow, RunSnapshot, StepTaskRecord, StepTaskRow, Timestamp};

pub use memory::MemoryStore;
pub use notifications::{ChangeNotification, NotificationHub};

/// Arguments of one long-poll claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub queue_name: String,
    /// How long claimed tasks stay invisible to other pollers.
    pub visibility_timeout: Duration,
    /// Maximum number of tasks to claim.
    pub qty: usize,
    /// How long the store may wait for at least one visible task.
    pub max_poll: Duration,
    /// Re-check cadence while waiting.
    pub poll_interval: Duration,
}

/// Who is sending a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    pub worker_id: Uuid,
    pub queue_name: String,
    pub function_name: String,
}

impl WorkerIdentity {
    pub fn new(queue_name: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            function_name: function_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub recorded_at: Timestamp,
    /// The worker has been retired and should stop taking new work.
    pub deprecated: bool,
}

/// Store operations used by workers and clients.
#[async_trait]
pub trait SqlGateway: Send + Sync {
    /// Create a run and activate its dependency-free steps in one go.
    async fn start_flow(&self, flow_slug: &str, input: Value, run_id: Option<Uuid>)
    -> Result<RunRow>;

    /// Claim up to `qty` ready tasks, waiting up to `max_poll` for the first.
    async fn poll_for_tasks(&self, request: &PollRequest) -> Result<Vec<StepTaskRecord>>;

    /// Record a task's output. Completing an already-completed task is a no-op.
    async fn complete_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: u32,
        output: Value,
    ) -> Result<StepTaskRow>;

    /// Record a task failure; requeues with backoff while attempts remain.
    async fn fail_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: u32,
        error_message: &str,
    ) -> Result<StepTaskRow>;

    /// Run, step states and tasks in one consistent read.
    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunSnapshot>>;

    async fn record_heartbeat(&self, worker: &WorkerIdentity) -> Result<HeartbeatAck>;
}

/// Per-run change notifications. Dropping the receiver unsubscribes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, run_id: Uuid) -> Result<broadcast::Receiver<ChangeNotification>>;
}

/// Attempts made by [`retry_transient`] before giving up.
pub const TRANSIENT_RETRY_ATTEMPTS: u32 = 3;
/// Base pause between transient retries; grows linearly per attempt.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run a gateway call, retrying it while it fails with a transient error.
///
/// Non-transient errors and the last transient error are returned as is.
pub async fn retry_transient<T, F, Fut>(operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(err) if err.is_transient() && attempt < TRANSIENT_RETRY_ATTEMPTS => {
                warn!(operation, attempt, error = %err, "transient store error; retrying");
                tokio::time::sleep(TRANSIENT_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
