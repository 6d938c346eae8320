// src/worker/heartbeat.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::store::{HeartbeatAck, SqlGateway, WorkerIdentity};

/// Periodic liveness writes for one worker identity.
pub struct Heartbeat {
    gateway: Arc<dyn SqlGateway>,
    identity: WorkerIdentity,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(gateway: Arc<dyn SqlGateway>, identity: WorkerIdentity, interval: Duration) -> Self {
        Self {
            gateway,
            identity,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Record a single heartbeat.
    pub async fn beat(&self) -> Result<HeartbeatAck> {
        self.gateway.record_heartbeat(&self.identity).await
    }

    /// Beat on every tick until stopped. Failed beats are logged and retried
    /// on the next tick. When the store reports the worker as deprecated,
    /// `on_deprecated` is cancelled once.
    pub fn start(self, on_deprecated: CancellationToken) -> HeartbeatHandle {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                worker_id = %self.identity.worker_id,
                interval_ms = self.interval.as_millis() as u64,
                "heartbeat started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.beat().await {
                    Ok(ack) if ack.deprecated && !on_deprecated.is_cancelled() => {
                        warn!(worker_id = %self.identity.worker_id, "worker deprecated by the store");
                        on_deprecated.cancel();
                    }
                    Ok(_) => debug!(worker_id = %self.identity.worker_id, "heartbeat recorded"),
                    Err(err) => {
                        warn!(worker_id = %self.identity.worker_id, error = %err, "heartbeat failed");
                    }
                }
            }
            debug!(worker_id = %self.identity.worker_id, "heartbeat stopped");
        });

        HeartbeatHandle { stop, join }
    }
}

pub struct HeartbeatHandle {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "heartbeat task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PgflowError;
    use crate::state::{RunRow, RunSnapshot, StepTaskRecord, StepTaskRow};
    use crate::store::{MemoryStore, PollRequest};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn beats_at_the_configured_cadence() {
        let store = Arc::new(MemoryStore::new());
        let identity = WorkerIdentity::new("q", "worker");
        let worker_id = identity.worker_id;
        let handle = Heartbeat::new(store.clone(), identity, Duration::from_secs(5))
            .start(CancellationToken::new());

        // First tick fires immediately, then every 5s.
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        handle.stop().await;
        assert_eq!(store.heartbeat_count(worker_id), 3);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(store.heartbeat_count(worker_id), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deprecation_is_signalled() {
        let store = Arc::new(MemoryStore::new());
        let identity = WorkerIdentity::new("q", "worker");
        store.record_heartbeat(&identity).await.unwrap();
        store.deprecate_worker(identity.worker_id);

        let deprecated = CancellationToken::new();
        let handle = Heartbeat::new(store.clone(), identity, Duration::from_secs(1)).start(deprecated.clone());
        tokio::time::timeout(Duration::from_secs(2), deprecated.cancelled())
            .await
            .unwrap();
        handle.stop().await;
    }

    /// Gateway whose heartbeat fails on every other call.
    struct Flaky {
        calls: AtomicU32,
        inner: MemoryStore,
    }

    #[async_trait]
    impl SqlGateway for Flaky {
        async fn start_flow(&self, slug: &str, input: Value, run_id: Option<Uuid>) -> Result<RunRow> {
            self.inner.start_flow(slug, input, run_id).await
        }
        async fn poll_for_tasks(&self, request: &PollRequest) -> Result<Vec<StepTaskRecord>> {
            self.inner.poll_for_tasks(request).await
        }
        async fn complete_task(&self, run_id: Uuid, step: &str, idx: u32, output: Value) -> Result<StepTaskRow> {
            self.inner.complete_task(run_id, step, idx, output).await
        }
        async fn fail_task(&self, run_id: Uuid, step: &str, idx: u32, msg: &str) -> Result<StepTaskRow> {
            self.inner.fail_task(run_id, step, idx, msg).await
        }
        async fn get_run(&self, run_id: Uuid) -> Result<Option<RunSnapshot>> {
            self.inner.get_run(run_id).await
        }
        async fn record_heartbeat(&self, worker: &WorkerIdentity) -> Result<HeartbeatAck> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(PgflowError::Transient("connection reset".into()));
            }
            self.inner.record_heartbeat(worker).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let gateway = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            inner: MemoryStore::new(),
        });
        let identity = WorkerIdentity::new("q", "worker");
        let worker_id = identity.worker_id;
        let handle = Heartbeat::new(gateway.clone(), identity, Duration::from_secs(1))
            .start(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        handle.stop().await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 4);
        assert_eq!(gateway.inner.heartbeat_count(worker_id), 2);
    }
}
