use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pgflow::worker::{StepContext, StepHandler};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One handler invocation as seen by a [`Recorder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: u32,
    pub attempt: u32,
    pub input: Value,
    /// When the handler was entered, on the tokio clock.
    pub at: Instant,
}

/// Shared log of handler invocations, in call order.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ctx: &StepContext) {
        self.calls.lock().unwrap().push(Invocation {
            run_id: ctx.run_id(),
            step_slug: ctx.step_slug().to_string(),
            task_index: ctx.task_index(),
            attempt: ctx.attempt(),
            input: ctx.input().clone(),
            at: Instant::now(),
        });
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Step slugs in call order.
    pub fn steps(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.step_slug).collect()
    }

    pub fn calls_for(&self, step_slug: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.step_slug == step_slug)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records every call and answers with `respond(input)`.
pub struct RecordingHandler<F> {
    recorder: Recorder,
    respond: F,
}

impl<F> RecordingHandler<F>
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    pub fn new(recorder: &Recorder, respond: F) -> Arc<Self> {
        Arc::new(Self {
            recorder: recorder.clone(),
            respond,
        })
    }
}

#[async_trait]
impl<F> StepHandler for RecordingHandler<F>
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    async fn handle(&self, ctx: StepContext) -> anyhow::Result<Value> {
        self.recorder.record(&ctx);
        Ok((self.respond)(ctx.input()))
    }
}

/// Records every call and returns `output` unchanged.
pub fn constant(recorder: &Recorder, output: Value) -> Arc<dyn StepHandler> {
    RecordingHandler::new(recorder, move |_| output.clone())
}

/// Fails the first `failures` attempts of every task, then returns `output`.
pub struct FailingHandler {
    recorder: Recorder,
    failures: u32,
    output: Value,
}

impl FailingHandler {
    pub fn new(recorder: &Recorder, failures: u32, output: Value) -> Arc<Self> {
        Arc::new(Self {
            recorder: recorder.clone(),
            failures,
            output,
        })
    }

    /// Never succeeds.
    pub fn always(recorder: &Recorder) -> Arc<Self> {
        Self::new(recorder, u32::MAX, Value::Null)
    }
}

#[async_trait]
impl StepHandler for FailingHandler {
    async fn handle(&self, ctx: StepContext) -> anyhow::Result<Value> {
        self.recorder.record(&ctx);
        if ctx.attempt() <= self.failures {
            anyhow::bail!("attempt {} failed", ctx.attempt());
        }
        Ok(self.output.clone())
    }
}

/// Tracks how many handler calls run at the same time.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max_observed(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds every call until the gate opens (or `hold` elapses, if set), then
/// returns its output, or echoes the input when none was set.
pub struct BlockingHandler {
    probe: ConcurrencyProbe,
    gate: CancellationToken,
    hold: Option<Duration>,
    output: Option<Value>,
}

impl BlockingHandler {
    /// Returns the handler and the gate that releases it.
    pub fn gated(probe: &ConcurrencyProbe) -> (Arc<Self>, CancellationToken) {
        let gate = CancellationToken::new();
        let handler = Arc::new(Self {
            probe: probe.clone(),
            gate: gate.clone(),
            hold: None,
            output: None,
        });
        (handler, gate)
    }

    /// Like [`gated`](Self::gated), answering with `output`.
    pub fn gated_returning(probe: &ConcurrencyProbe, output: Value) -> (Arc<Self>, CancellationToken) {
        let gate = CancellationToken::new();
        let handler = Arc::new(Self {
            probe: probe.clone(),
            gate: gate.clone(),
            hold: None,
            output: Some(output),
        });
        (handler, gate)
    }

    pub fn sleeping(probe: &ConcurrencyProbe, hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            probe: probe.clone(),
            gate: CancellationToken::new(),
            hold: Some(hold),
            output: None,
        })
    }
}

#[async_trait]
impl StepHandler for BlockingHandler {
    async fn handle(&self, ctx: StepContext) -> anyhow::Result<Value> {
        self.probe.enter();
        let hold = async {
            match self.hold {
                Some(hold) => tokio::time::sleep(hold).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = tokio::select! {
            _ = self.gate.cancelled() => false,
            _ = hold => false,
            _ = ctx.cancel.cancelled() => true,
        };
        self.probe.exit();
        if cancelled {
            anyhow::bail!("cancelled");
        }
        Ok(self.output.clone().unwrap_or_else(|| ctx.input().clone()))
    }
}
