// src/worker/lifecycle.rs

//! The long-running worker: heartbeat plus a batch processor loop.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::{PgflowError, Result};
use crate::store::{SqlGateway, WorkerIdentity};
use crate::worker::batch::{BatchProcessor, BatchReport};
use crate::worker::controller::{ControllerStats, ExecutionController};
use crate::worker::executor::{HandlerRegistry, TaskExecutor};
use crate::worker::heartbeat::{Heartbeat, HeartbeatHandle};
use crate::worker::poller::StepTaskPoller;
use crate::worker::{WorkerConfig, WorkerMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Running {
    processing: JoinHandle<Result<BatchReport>>,
    heartbeat: HeartbeatHandle,
}

pub struct Worker {
    config: WorkerConfig,
    gateway: Arc<dyn SqlGateway>,
    identity: WorkerIdentity,
    state: Mutex<WorkerState>,
    /// Cancels everything, in-flight handlers included.
    abort: CancellationToken,
    /// Stops polling only; a child of `abort`.
    polling: CancellationToken,
    controller: Arc<ExecutionController>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.identity.worker_id)
            .field("queue", &self.config.queue_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(gateway: Arc<dyn SqlGateway>, handlers: HandlerRegistry, config: WorkerConfig) -> Self {
        let identity = WorkerIdentity::new(config.queue_name.clone(), env!("CARGO_PKG_NAME"));
        let abort = CancellationToken::new();
        let polling = abort.child_token();
        let executor = Arc::new(TaskExecutor::new(Arc::clone(&gateway), handlers));
        let controller = Arc::new(ExecutionController::new(executor, config.max_concurrent, abort.clone()));
        Self {
            config,
            gateway,
            identity,
            state: Mutex::new(WorkerState::Created),
            abort,
            polling,
            controller,
            running: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.lock_state()
    }

    pub fn stats(&self) -> ControllerStats {
        self.controller.stats()
    }

    /// True once polling has stopped, by `stop` or because the store
    /// deprecated this worker.
    pub fn is_draining(&self) -> bool {
        self.polling.is_cancelled()
    }

    /// Start the heartbeat and the processing loop in the background.
    pub fn start(&self) -> Result<()> {
        self.transition(WorkerState::Starting)?;
        info!(
            worker_id = %self.identity.worker_id,
            queue = %self.config.queue_name,
            max_concurrent = self.config.max_concurrent,
            mode = ?self.config.mode,
            "starting worker"
        );

        let heartbeat = Heartbeat::new(
            Arc::clone(&self.gateway),
            self.identity.clone(),
            self.config.heartbeat_interval,
        )
        .start(self.polling.clone());

        let poller = StepTaskPoller::new(Arc::clone(&self.gateway), &self.config, self.polling.clone());
        let idle_pause = self.config.max_poll_seconds.is_zero().then_some(self.config.poll_interval);
        let processor = BatchProcessor::new(
            poller,
            Arc::clone(&self.controller),
            idle_pause,
            self.polling.clone(),
        );
        let mode: WorkerMode = self.config.mode;
        let processing = tokio::spawn(async move { processor.run(mode).await });

        *self.lock_running() = Some(Running { processing, heartbeat });
        self.transition(WorkerState::Running)
    }

    /// Cancel polling and in-flight handlers, then wait for everything to
    /// wind down. Unfinished tasks are redelivered after their visibility
    /// timeout.
    pub async fn stop(&self) -> Result<BatchReport> {
        self.begin_stopping()?;
        info!(worker_id = %self.identity.worker_id, "stopping worker");
        self.abort.cancel();

        let running = self.lock_running().take();
        let Some(Running { processing, heartbeat }) = running else {
            // A concurrent `join` owns the loop and finishes the shutdown.
            return Ok(BatchReport::default());
        };
        let report = flatten(processing.await);
        self.finish(heartbeat).await?;
        report
    }

    /// Wait for the processing loop to end on its own (deprecation or a
    /// fatal error), let in-flight tasks finish, then stop.
    pub async fn join(&self) -> Result<BatchReport> {
        let running = self.lock_running().take();
        let Some(Running { processing, heartbeat }) = running else {
            return Err(PgflowError::Lifecycle(format!(
                "worker is {}; nothing to join",
                self.state()
            )));
        };
        let report = flatten(processing.await);
        if let Err(err) = &report {
            error!(worker_id = %self.identity.worker_id, error = %err, "processing loop failed");
        }
        self.begin_stopping()?;
        self.polling.cancel();
        self.finish(heartbeat).await?;
        report
    }

    async fn finish(&self, heartbeat: HeartbeatHandle) -> Result<()> {
        self.controller.await_completion().await;
        heartbeat.stop().await;
        self.transition(WorkerState::Stopped)?;
        info!(worker_id = %self.identity.worker_id, stats = ?self.controller.stats(), "worker stopped");
        Ok(())
    }

    /// `Running -> Stopping`; already stopping is fine.
    fn begin_stopping(&self) -> Result<()> {
        if self.state() == WorkerState::Stopping {
            return Ok(());
        }
        self.transition(WorkerState::Stopping)
    }

    fn transition(&self, next: WorkerState) -> Result<()> {
        let mut state = self.lock_state();
        if !state.can_transition_to(next) {
            return Err(PgflowError::Lifecycle(format!(
                "cannot move worker from {} to {next}",
                *state
            )));
        }
        *state = next;
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn flatten(joined: std::result::Result<Result<BatchReport>, tokio::task::JoinError>) -> Result<BatchReport> {
    joined.map_err(|err| PgflowError::Lifecycle(format!("processing loop panicked: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Flow, RetryPolicy, StepDefinition};
    use crate::state::RunStatus;
    use crate::store::MemoryStore;
    use crate::worker::executor::{handler_fn, StepContext};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn state_machine_only_moves_forward() {
        use WorkerState::*;
        assert!(Created.can_transition_to(Starting));
        assert!(Running.can_transition_to(Stopping));
        assert!(!Running.can_transition_to(Created));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Created.can_transition_to(Running));
    }

    fn echo_worker(store: Arc<MemoryStore>) -> Worker {
        let handlers = HandlerRegistry::new().with(
            "echo",
            handler_fn(|ctx: StepContext| async move { Ok(ctx.input()["run"].clone()) }),
        );
        let config = WorkerConfig {
            max_poll_seconds: Duration::from_millis(500),
            ..WorkerConfig::for_queue("echo")
        };
        Worker::new(store, handlers, config)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_between_start_and_stop() {
        let store = Arc::new(MemoryStore::new());
        store.register_flow(Flow::new("echo", RetryPolicy::default(), vec![StepDefinition::single("echo")]).unwrap());
        let worker = echo_worker(store.clone());
        assert_eq!(worker.state(), WorkerState::Created);

        worker.start().unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        assert!(worker.start().is_err());

        let run = store.start_flow("echo", json!({"hi": 1}), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let report = worker.stop().await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(store.heartbeat_count(worker.identity().worker_id) >= 1);

        let snap = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(snap.run.status, RunStatus::Completed);
        assert_eq!(snap.run.output, Some(json!({"echo": {"hi": 1}})));
    }

    #[tokio::test(start_paused = true)]
    async fn deprecation_drains_the_worker() {
        let store = Arc::new(MemoryStore::new());
        let worker = echo_worker(store.clone());
        worker.start().unwrap();

        // Let the first heartbeat register the worker.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.deprecate_worker(worker.identity().worker_id));

        let report = tokio::time::timeout(Duration::from_secs(30), worker.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.started, 0);
        assert!(worker.is_draining());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}
