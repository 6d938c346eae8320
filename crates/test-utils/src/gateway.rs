use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pgflow::errors::{PgflowError, Result};
use pgflow::state::{RunRow, RunSnapshot, StepTaskRecord, StepTaskRow};
use pgflow::store::{HeartbeatAck, PollRequest, SqlGateway, WorkerIdentity};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    StartFlow,
    Poll,
    Complete,
    Fail,
    GetRun,
    Heartbeat,
}

/// Wraps a gateway and fails chosen operations with transient errors.
pub struct FlakyGateway {
    inner: Arc<dyn SqlGateway>,
    pending: Mutex<HashMap<GatewayOp, u32>>,
    calls: Mutex<HashMap<GatewayOp, u32>>,
}

impl FlakyGateway {
    pub fn new(inner: Arc<dyn SqlGateway>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            pending: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    /// Fail the next `n` calls of `op`.
    pub fn fail_next(&self, op: GatewayOp, n: u32) {
        *self.pending.lock().unwrap().entry(op).or_default() += n;
    }

    /// Calls of `op` so far, failed ones included.
    pub fn calls(&self, op: GatewayOp) -> u32 {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn check(&self, op: GatewayOp) -> Result<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(PgflowError::Transient(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SqlGateway for FlakyGateway {
    async fn start_flow(&self, flow_slug: &str, input: Value, run_id: Option<Uuid>) -> Result<RunRow> {
        self.check(GatewayOp::StartFlow)?;
        self.inner.start_flow(flow_slug, input, run_id).await
    }

    async fn poll_for_tasks(&self, request: &PollRequest) -> Result<Vec<StepTaskRecord>> {
        self.check(GatewayOp::Poll)?;
        self.inner.poll_for_tasks(request).await
    }

    async fn complete_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: u32,
        output: Value,
    ) -> Result<StepTaskRow> {
        self.check(GatewayOp::Complete)?;
        self.inner.complete_task(run_id, step_slug, task_index, output).await
    }

    async fn fail_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: u32,
        error_message: &str,
    ) -> Result<StepTaskRow> {
        self.check(GatewayOp::Fail)?;
        self.inner.fail_task(run_id, step_slug, task_index, error_message).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunSnapshot>> {
        self.check(GatewayOp::GetRun)?;
        self.inner.get_run(run_id).await
    }

    async fn record_heartbeat(&self, worker: &WorkerIdentity) -> Result<HeartbeatAck> {
        self.check(GatewayOp::Heartbeat)?;
        self.inner.record_heartbeat(worker).await
    }
}
