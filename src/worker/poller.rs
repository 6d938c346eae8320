// src/worker/poller.rs

//! Long-poll claims against the gateway.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{PgflowError, Result};
use crate::state::{StepStatus, StepTaskRecord};
use crate::store::{PollRequest, SqlGateway};
use crate::worker::WorkerConfig;

pub struct StepTaskPoller {
    gateway: Arc<dyn SqlGateway>,
    request: PollRequest,
    cancel: CancellationToken,
}

impl StepTaskPoller {
    pub fn new(gateway: Arc<dyn SqlGateway>, config: &WorkerConfig, cancel: CancellationToken) -> Self {
        Self {
            gateway,
            request: PollRequest {
                queue_name: config.queue_name.clone(),
                visibility_timeout: config.visibility_timeout,
                qty: config.batch_size,
                max_poll: config.max_poll_seconds,
                poll_interval: config.poll_interval,
            },
            cancel,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.request.queue_name
    }

    pub fn batch_size(&self) -> usize {
        self.request.qty
    }

    /// One poll cycle of up to `batch_size` tasks.
    pub async fn poll(&self) -> Result<Vec<StepTaskRecord>> {
        self.poll_up_to(self.request.qty).await
    }

    /// One poll cycle of up to `min(limit, batch_size)` tasks.
    ///
    /// Returns an empty batch when cancelled or when the store reports a
    /// transient error. A record whose step is not `started` is an error.
    pub async fn poll_up_to(&self, limit: usize) -> Result<Vec<StepTaskRecord>> {
        let qty = limit.min(self.request.qty);
        if qty == 0 || self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let request = PollRequest {
            qty,
            ..self.request.clone()
        };

        let polled = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Vec::new()),
            polled = self.gateway.poll_for_tasks(&request) => polled,
        };

        let tasks = match polled {
            Ok(tasks) => tasks,
            Err(err) if err.is_transient() => {
                warn!(queue = %request.queue_name, error = %err, "poll failed; will retry next cycle");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        for task in &tasks {
            ensure_consistent(task)?;
        }
        if !tasks.is_empty() {
            debug!(queue = %request.queue_name, count = tasks.len(), "polled tasks");
        }
        Ok(tasks)
    }
}

fn ensure_consistent(task: &StepTaskRecord) -> Result<()> {
    if task.step_status != StepStatus::Started {
        return Err(PgflowError::InconsistentTask {
            run_id: task.run_id,
            step_slug: task.step_slug.clone(),
            task_index: task.task_index,
            reason: format!("step status is '{}', expected 'started'", task.step_status),
        });
    }
    Ok(())
}
