// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PgflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Cycle detected in flow graph: {0}")]
    DagCycle(String),

    #[error("Invalid retry configuration: {0}")]
    InvalidRetryConfig(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Step not found: {run_id}/{step_slug}")]
    StepNotFound { run_id: Uuid, step_slug: String },

    #[error("Task not found: {run_id}/{step_slug}[{task_index}]")]
    TaskNotFound {
        run_id: Uuid,
        step_slug: String,
        task_index: u32,
    },

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Inconsistent task record for {step_slug}[{task_index}] in run {run_id}: {reason}")]
    InconsistentTask {
        run_id: Uuid,
        step_slug: String,
        task_index: u32,
        reason: String,
    },

    #[error("Malformed run snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Timed out after {timeout_ms}ms waiting for status '{target}'")]
    WaitTimeout { target: String, timeout_ms: u128 },

    #[error("Wait for status '{target}' was cancelled")]
    WaitCancelled { target: String },

    #[error("Status '{target}' can no longer be reached (current status '{current}')")]
    StatusUnreachable { target: String, current: String },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Worker lifecycle error: {0}")]
    Lifecycle(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PgflowError {
    /// Infra errors that are retried at the gateway-call boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, PgflowError::Transient(_))
    }

    /// Errors that end the worker process that observed them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PgflowError::InconsistentTask { .. })
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PgflowError>;
