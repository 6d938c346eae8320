// src/worker/controller.rs

//! Bounded-concurrency admission of claimed tasks.
//!
//! Admission waits for a free slot; the slot is returned when the spawned
//! execution finishes, however it finishes. Cancelling the controller stops
//! admission and is propagated to in-flight runners as a child token, but
//! nothing is killed: claimed tasks that never report back reappear after
//! their visibility timeout.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::errors::Result;
use crate::state::{StepTaskRecord, TaskKey};
use crate::worker::executor::ExecutionOutcome;

/// Executes one claimed task. The controller calls this once per admission.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: StepTaskRecord, cancel: CancellationToken) -> Result<ExecutionOutcome>;
}

/// Result of [`ExecutionController::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    /// The same task is already in flight in this controller.
    Duplicate,
    /// The controller was cancelled before a slot became free.
    Aborted,
}

/// Point-in-time copy of the controller counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub in_flight: usize,
    pub max_observed: usize,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    /// Runner returned an error (the task was not reported to the store).
    pub errored: u64,
    pub duplicates: u64,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_observed: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    errored: AtomicU64,
    duplicates: AtomicU64,
}

type InFlightKey = (Uuid, TaskKey);

pub struct ExecutionController {
    runner: Arc<dyn TaskRunner>,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionController")
            .field("max_concurrent", &self.max_concurrent)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ExecutionController {
    /// `max_concurrent` is clamped to at least one slot.
    pub fn new(runner: Arc<dyn TaskRunner>, max_concurrent: usize, cancel: CancellationToken) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            runner,
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            cancel,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            counters: Arc::new(Counters::default()),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop admitting tasks and signal in-flight runners.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn available_slots(&self) -> usize {
        if self.cancel.is_cancelled() {
            0
        } else {
            self.permits.available_permits()
        }
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ControllerStats {
        let c = &self.counters;
        ControllerStats {
            in_flight: c.in_flight.load(Ordering::SeqCst),
            max_observed: c.max_observed.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            aborted: c.aborted.load(Ordering::SeqCst),
            errored: c.errored.load(Ordering::SeqCst),
            duplicates: c.duplicates.load(Ordering::SeqCst),
        }
    }

    /// Wait until at least one slot is free. Returns `false` if the
    /// controller is cancelled first.
    pub async fn wait_for_slot(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            permit = self.permits.acquire() => permit.is_ok(),
        }
    }

    /// Admit a task, waiting for a free slot if all are taken, and spawn its
    /// execution.
    pub async fn start(&self, task: StepTaskRecord) -> Admission {
        if self.cancel.is_cancelled() {
            return Admission::Aborted;
        }

        let Some(claim) = InFlightClaim::acquire(&self.in_flight, task.key()) else {
            self.counters.duplicates.fetch_add(1, Ordering::SeqCst);
            info!(
                run_id = %task.run_id,
                step = %task.step_slug,
                task_index = task.task_index,
                "task already in flight; dropping duplicate delivery"
            );
            return Admission::Duplicate;
        };

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            debug!(run_id = %task.run_id, step = %task.step_slug, "controller cancelled while waiting for a slot");
            return Admission::Aborted;
        };

        let running = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_observed.fetch_max(running, Ordering::SeqCst);

        let slot = Slot {
            _permit: permit,
            _claim: claim,
            counters: Arc::clone(&self.counters),
            idle: Arc::clone(&self.idle),
        };
        let runner = Arc::clone(&self.runner);
        let counters = Arc::clone(&self.counters);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let _slot = slot;
            let run_id = task.run_id;
            let step = task.step_slug.clone();
            let task_index = task.task_index;

            match runner.run(task, cancel).await {
                Ok(ExecutionOutcome::Completed) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(ExecutionOutcome::Failed(_)) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(ExecutionOutcome::Aborted) => {
                    counters.aborted.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    counters.errored.fetch_add(1, Ordering::SeqCst);
                    error!(
                        %run_id,
                        %step,
                        task_index,
                        error = %err,
                        "could not report task result; it will be redelivered after its visibility timeout"
                    );
                }
            }
        });

        Admission::Started
    }

    /// Resolve once nothing is in flight.
    pub async fn await_completion(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

}

/// Marks a task as in flight until dropped, whether admission went through
/// or the admitting future was abandoned while waiting for a slot.
struct InFlightClaim {
    key: InFlightKey,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl InFlightClaim {
    fn acquire(in_flight: &Arc<Mutex<HashSet<InFlightKey>>>, key: InFlightKey) -> Option<Self> {
        let inserted = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        inserted.then(|| Self {
            key,
            in_flight: Arc::clone(in_flight),
        })
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Held by a spawned execution; releases its slot on drop, including when
/// the runner panics.
struct Slot {
    _permit: OwnedSemaphorePermit,
    _claim: InFlightClaim,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.counters.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
