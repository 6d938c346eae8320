// src/worker/mod.rs

//! Worker side of the pipeline.
//!
//! - [`poller`] claims ready tasks from the queue.
//! - [`controller`] runs claimed tasks under a concurrency limit.
//! - [`executor`] invokes step handlers and reports results through the
//!   gateway.
//! - [`batch`] composes poller + controller into single-cycle or continuous
//!   processing.
//! - [`heartbeat`] records worker liveness.
//! - [`lifecycle`] owns the worker state machine and wires everything up.
//! - [`command`] is a step handler that runs shell commands.

pub mod batch;
pub mod command;
pub mod controller;
pub mod executor;
pub mod heartbeat;
pub mod lifecycle;
pub mod poller;

use std::time::Duration;

use serde::Deserialize;

pub use batch::{BatchProcessor, BatchReport};
pub use command::CommandHandler;
pub use controller::{Admission, ControllerStats, ExecutionController, TaskRunner};
pub use executor::{handler_fn, ExecutionOutcome, HandlerRegistry, StepContext, StepHandler, TaskExecutor};
pub use heartbeat::{Heartbeat, HeartbeatHandle};
pub use lifecycle::{Worker, WorkerState};
pub use poller::StepTaskPoller;

/// How a worker drives its batch processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    /// Poll and execute until stopped.
    #[default]
    Continuous,
    /// Repeated poll, execute, await-completion cycles.
    SingleCycle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    pub max_poll_seconds: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub mode: WorkerMode,
}

impl WorkerConfig {
    /// Defaults for a queue: 10 concurrent tasks, batches of 10, 2s
    /// visibility timeout, 2s long-poll checked every 100ms, heartbeat every
    /// 5s.
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            max_concurrent: 10,
            batch_size: 10,
            visibility_timeout: Duration::from_secs(2),
            max_poll_seconds: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(5000),
            mode: WorkerMode::Continuous,
        }
    }
}
