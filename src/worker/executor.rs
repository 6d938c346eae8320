// src/worker/executor.rs

//! Step handlers and the executor that runs them for claimed tasks.
//!
//! Whatever a handler does (return a value, return an error, panic, exceed
//! its timeout) ends up as exactly one `complete_task` or `fail_task` call,
//! except when the worker is shutting down: a handler that fails after
//! cancellation is left for visibility-timeout redelivery.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::state::StepTaskRecord;
use crate::store::{retry_transient, SqlGateway};
use crate::worker::controller::TaskRunner;

/// What a handler gets to work with.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task: StepTaskRecord,
    /// Cancelled when the worker shuts down; long handlers should watch it.
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn input(&self) -> &Value {
        &self.task.input
    }

    pub fn run_id(&self) -> Uuid {
        self.task.run_id
    }

    pub fn step_slug(&self) -> &str {
        &self.task.step_slug
    }

    pub fn task_index(&self) -> u32 {
        self.task.task_index
    }

    pub fn attempt(&self) -> u32 {
        self.task.attempt
    }
}

/// User code for one step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, ctx: StepContext) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, ctx: StepContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`StepHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers keyed by step slug.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step_slug: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_slug.into(), handler);
    }

    pub fn with(mut self, step_slug: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.register(step_slug, handler);
        self
    }

    pub fn get(&self, step_slug: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_slug).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(String),
    /// Cancelled during shutdown; not reported to the store.
    Aborted,
}

/// Runs handlers and funnels results back through the gateway.
pub struct TaskExecutor {
    gateway: Arc<dyn SqlGateway>,
    handlers: HandlerRegistry,
}

impl TaskExecutor {
    pub fn new(gateway: Arc<dyn SqlGateway>, handlers: HandlerRegistry) -> Self {
        Self { gateway, handlers }
    }

    async fn invoke(&self, task: &StepTaskRecord, cancel: CancellationToken) -> std::result::Result<Value, String> {
        let Some(handler) = self.handlers.get(&task.step_slug) else {
            return Err(format!("no handler registered for step '{}'", task.step_slug));
        };

        let ctx = StepContext {
            task: task.clone(),
            cancel,
        };
        let guarded = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();

        let outcome = if task.timeout.is_zero() {
            guarded.await
        } else {
            match tokio::time::timeout(task.timeout, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(format!(
                        "step '{}' timed out after {}s",
                        task.step_slug,
                        task.timeout.as_secs()
                    ));
                }
            }
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => Err(panic_message(panic)),
        }
    }

    async fn complete(&self, task: &StepTaskRecord, output: Value) -> Result<()> {
        retry_transient("complete_task", || {
            self.gateway
                .complete_task(task.run_id, &task.step_slug, task.task_index, output.clone())
        })
        .await?;
        Ok(())
    }

    async fn fail(&self, task: &StepTaskRecord, message: &str) -> Result<()> {
        retry_transient("fail_task", || {
            self.gateway
                .fail_task(task.run_id, &task.step_slug, task.task_index, message)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for TaskExecutor {
    async fn run(&self, task: StepTaskRecord, cancel: CancellationToken) -> Result<ExecutionOutcome> {
        debug!(
            run_id = %task.run_id,
            step = %task.step_slug,
            task_index = task.task_index,
            attempt = task.attempt,
            "executing task"
        );

        match self.invoke(&task, cancel.clone()).await {
            Ok(output) => {
                self.complete(&task, output).await?;
                debug!(run_id = %task.run_id, step = %task.step_slug, task_index = task.task_index, "task completed");
                Ok(ExecutionOutcome::Completed)
            }
            Err(message) if cancel.is_cancelled() => {
                info!(
                    run_id = %task.run_id,
                    step = %task.step_slug,
                    task_index = task.task_index,
                    error = %message,
                    "handler stopped during shutdown; leaving task for redelivery"
                );
                Ok(ExecutionOutcome::Aborted)
            }
            Err(message) => {
                warn!(
                    run_id = %task.run_id,
                    step = %task.step_slug,
                    task_index = task.task_index,
                    attempt = task.attempt,
                    error = %message,
                    "task failed"
                );
                self.fail(&task, &message).await?;
                Ok(ExecutionOutcome::Failed(message))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Flow, RetryPolicy, StepDefinition};
    use crate::state::{StepStatus, TaskStatus};
    use crate::store::{MemoryStore, PollRequest};
    use serde_json::json;
    use std::time::Duration;

    async fn claimed(store: &MemoryStore, flow: Flow) -> StepTaskRecord {
        let slug = flow.slug().to_string();
        store.register_flow(flow);
        store.start_flow(&slug, json!({"x": 2}), None).await.unwrap();
        let mut tasks = store
            .poll_for_tasks(&PollRequest {
                queue_name: slug,
                visibility_timeout: Duration::from_secs(5),
                qty: 1,
                max_poll: Duration::ZERO,
                poll_interval: Duration::from_millis(10),
            })
            .await
            .unwrap();
        tasks.remove(0)
    }

    fn one_step(max_attempts: u32) -> Flow {
        Flow::new(
            "exec",
            RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
            vec![StepDefinition::single("s")],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn successful_handler_completes_the_task() {
        let store = Arc::new(MemoryStore::new());
        let task = claimed(&store, one_step(3)).await;
        let handlers = HandlerRegistry::new().with(
            "s",
            handler_fn(|ctx: StepContext| async move {
                Ok(json!(ctx.input()["run"]["x"].as_i64().unwrap_or(0) * 10))
            }),
        );
        let executor = TaskExecutor::new(store.clone(), handlers);

        let outcome = executor.run(task.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let snap = store.get_run(task.run_id).await.unwrap().unwrap();
        assert_eq!(snap.step("s").unwrap().status, StepStatus::Completed);
        assert_eq!(snap.step("s").unwrap().output, Some(json!(20)));
    }

    #[tokio::test]
    async fn panics_and_missing_handlers_become_failures() {
        let store = Arc::new(MemoryStore::new());
        let task = claimed(&store, one_step(3)).await;
        let handlers = HandlerRegistry::new().with(
            "s",
            handler_fn(|_ctx: StepContext| async move {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            }),
        );
        let executor = TaskExecutor::new(store.clone(), handlers);
        let outcome = executor.run(task.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Failed("handler panicked: boom".to_string()));

        let snap = store.get_run(task.run_id).await.unwrap().unwrap();
        let row = &snap.tasks[0];
        assert_eq!(row.status, TaskStatus::Queued);
        assert_eq!(row.attempts_count, 1);
        assert_eq!(row.error_message.as_deref(), Some("handler panicked: boom"));

        let bare = TaskExecutor::new(store.clone(), HandlerRegistry::new());
        let outcome = bare.run(task, CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed(msg) if msg.contains("no handler")));
    }

    #[tokio::test]
    async fn failure_after_cancellation_is_not_reported() {
        let store = Arc::new(MemoryStore::new());
        let task = claimed(&store, one_step(3)).await;
        let handlers = HandlerRegistry::new().with(
            "s",
            handler_fn(|ctx: StepContext| async move {
                ctx.cancel.cancelled().await;
                anyhow::bail!("interrupted")
            }),
        );
        let executor = TaskExecutor::new(store.clone(), handlers);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = executor.run(task.clone(), cancel).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Aborted);

        let snap = store.get_run(task.run_id).await.unwrap().unwrap();
        assert_eq!(snap.tasks[0].status, TaskStatus::Started);
        assert_eq!(snap.tasks[0].attempts_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_hits_the_step_timeout() {
        let store = Arc::new(MemoryStore::new());
        let flow = Flow::new(
            "exec",
            RetryPolicy::default(),
            vec![StepDefinition::single("s").timeout(1)],
        )
        .unwrap();
        let task = claimed(&store, flow).await;
        let handlers = HandlerRegistry::new().with(
            "s",
            handler_fn(|_ctx: StepContext| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        );
        let executor = TaskExecutor::new(store.clone(), handlers);

        let outcome = executor.run(task, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Failed("step 's' timed out after 1s".to_string()));
    }
}
