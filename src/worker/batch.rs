// src/worker/batch.rs

//! Poll, execute, await: one cycle at a time or in a loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::Result;
use crate::worker::controller::{Admission, ExecutionController};
use crate::worker::poller::StepTaskPoller;
use crate::worker::WorkerMode;

/// Tally of what a batch (or a whole loop) did with polled tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub polled: usize,
    pub started: usize,
    pub duplicates: usize,
    pub aborted: usize,
}

impl BatchReport {
    fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Started => self.started += 1,
            Admission::Duplicate => self.duplicates += 1,
            Admission::Aborted => self.aborted += 1,
        }
    }

    fn absorb(&mut self, other: BatchReport) {
        self.polled += other.polled;
        self.started += other.started;
        self.duplicates += other.duplicates;
        self.aborted += other.aborted;
    }
}

pub struct BatchProcessor {
    poller: StepTaskPoller,
    controller: Arc<ExecutionController>,
    idle_pause: Option<Duration>,
    cancel: CancellationToken,
}

impl BatchProcessor {
    /// `idle_pause` is slept after an empty poll; pass `None` when the poll
    /// itself waits (a non-zero long-poll window).
    pub fn new(
        poller: StepTaskPoller,
        controller: Arc<ExecutionController>,
        idle_pause: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            poller,
            controller,
            idle_pause,
            cancel,
        }
    }

    pub fn controller(&self) -> &Arc<ExecutionController> {
        &self.controller
    }

    /// Poll once, run everything returned and wait for it to finish.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let tasks = self.poller.poll().await?;
        let mut report = BatchReport {
            polled: tasks.len(),
            ..BatchReport::default()
        };
        for task in tasks {
            report.record(self.controller.start(task).await);
        }
        self.controller.await_completion().await;
        debug!(?report, "batch finished");
        Ok(report)
    }

    /// Poll and execute until cancelled, only ever asking for as many tasks
    /// as there are free slots. In-flight tasks are not awaited here.
    pub async fn run_continuous(&self) -> Result<BatchReport> {
        info!(queue = %self.poller.queue_name(), "continuous processing started");
        let mut total = BatchReport::default();

        while !self.cancel.is_cancelled() {
            if !self.controller.wait_for_slot().await {
                break;
            }
            let tasks = self.poller.poll_up_to(self.controller.available_slots()).await?;
            if tasks.is_empty() {
                self.pause().await;
                continue;
            }

            total.polled += tasks.len();
            for task in tasks {
                total.record(self.controller.start(task).await);
            }
        }

        info!(?total, "continuous processing stopped");
        Ok(total)
    }

    /// Repeated [`process_batch`](Self::process_batch) cycles until cancelled.
    pub async fn run_cycles(&self) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        while !self.cancel.is_cancelled() {
            let report = self.process_batch().await?;
            if report.polled == 0 {
                self.pause().await;
            }
            total.absorb(report);
        }
        Ok(total)
    }

    pub async fn run(&self, mode: WorkerMode) -> Result<BatchReport> {
        match mode {
            WorkerMode::Continuous => self.run_continuous().await,
            WorkerMode::SingleCycle => self.run_cycles().await,
        }
    }

    async fn pause(&self) {
        if let Some(pause) = self.idle_pause {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
