// src/store/memory.rs

//! In-process store implementing [`SqlGateway`] and [`ChangeFeed`].
//!
//! All state sits behind one mutex, so every gateway call is atomic the way
//! a single SQL transaction would be. Change notifications are published
//! while that lock is held, which keeps each run's notification order equal
//! to its commit order.
//!
//! Queue visibility uses `tokio::time::Instant`, so tests running on a
//! paused clock can step through visibility timeouts and retry delays.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{PgflowError, Result};
use crate::flow::{Flow, SkipPolicy, StepType};
use crate::state::{
    check_task_transition, check_transition, Lifecycle, RunRow, RunSnapshot, RunStatus,
    SkipReason, StepStateRow, StepStatus, StepTaskRecord, StepTaskRow, TaskKey, TaskStatus,
    Timestamp,
};
use crate::store::{
    ChangeFeed, ChangeNotification, HeartbeatAck, NotificationHub, PollRequest, SqlGateway,
    WorkerIdentity,
};

struct TaskEntry {
    row: StepTaskRow,
    input: Value,
}

struct RunEntry {
    flow: Arc<Flow>,
    row: RunRow,
    steps: HashMap<String, StepStateRow>,
    tasks: BTreeMap<TaskKey, TaskEntry>,
}

struct QueuedMessage {
    msg_id: i64,
    queue_name: String,
    run_id: Uuid,
    key: TaskKey,
    visible_at: Instant,
    read_ct: u32,
}

struct WorkerEntry {
    identity: WorkerIdentity,
    last_heartbeat_at: Timestamp,
    beats: u64,
    deprecated: bool,
}

#[derive(Default)]
struct StoreState {
    flows: HashMap<String, Arc<Flow>>,
    runs: HashMap<Uuid, RunEntry>,
    queue: BTreeMap<i64, QueuedMessage>,
    next_msg_id: i64,
    workers: HashMap<Uuid, WorkerEntry>,
}

/// Queue-side view of a task's message, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub message_id: i64,
    /// Time left until the message becomes visible (zero if it already is).
    pub visible_in: Duration,
    pub read_ct: u32,
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
    hub: NotificationHub,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_msg_id: 1,
                ..StoreState::default()
            }),
            hub: NotificationHub::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a flow available to `start_flow`. Re-registering a slug replaces
    /// the definition for runs started afterwards.
    pub fn register_flow(&self, flow: Flow) -> Arc<Flow> {
        let flow = Arc::new(flow);
        info!(flow = %flow.slug(), steps = flow.step_count(), "registered flow");
        self.state()
            .flows
            .insert(flow.slug().to_string(), Arc::clone(&flow));
        flow
    }

    pub fn flow(&self, slug: &str) -> Option<Arc<Flow>> {
        self.state().flows.get(slug).cloned()
    }

    /// Message backing a task, if it is still in the queue.
    pub fn message_info(&self, run_id: Uuid, step_slug: &str, task_index: u32) -> Option<MessageInfo> {
        let state = self.state();
        let now = Instant::now();
        state
            .queue
            .values()
            .find(|m| m.run_id == run_id && m.key.step_slug == step_slug && m.key.task_index == task_index)
            .map(|m| MessageInfo {
                message_id: m.msg_id,
                visible_in: m.visible_at.saturating_duration_since(now),
                read_ct: m.read_ct,
            })
    }

    /// Messages in a queue, visible or not.
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.state()
            .queue
            .values()
            .filter(|m| m.queue_name == queue_name)
            .count()
    }

    /// Retire a worker; its next heartbeat reports `deprecated`.
    pub fn deprecate_worker(&self, worker_id: Uuid) -> bool {
        match self.state().workers.get_mut(&worker_id) {
            Some(w) => {
                w.deprecated = true;
                info!(%worker_id, queue = %w.identity.queue_name, "worker deprecated");
                true
            }
            None => false,
        }
    }

    pub fn last_heartbeat(&self, worker_id: Uuid) -> Option<Timestamp> {
        self.state().workers.get(&worker_id).map(|w| w.last_heartbeat_at)
    }

    pub fn heartbeat_count(&self, worker_id: Uuid) -> u64 {
        self.state().workers.get(&worker_id).map(|w| w.beats).unwrap_or(0)
    }

    /// Live change-feed receivers for a run.
    pub fn subscriber_count(&self, run_id: Uuid) -> usize {
        self.hub.subscriber_count(run_id)
    }

    /// Drop a run's notification topic as if the transport disconnected.
    pub fn disconnect(&self, run_id: Uuid) -> bool {
        self.hub.close(run_id)
    }

    fn with_run<T>(&self, run_id: Uuid, f: impl FnOnce(&mut RunTxn<'_>) -> Result<T>) -> Result<T> {
        let mut state = self.state();
        let StoreState {
            runs,
            queue,
            next_msg_id,
            ..
        } = &mut *state;
        let run = runs.get_mut(&run_id).ok_or(PgflowError::RunNotFound(run_id))?;
        let mut txn = RunTxn {
            run,
            queue,
            next_msg_id,
            hub: &self.hub,
            now: Utc::now(),
            clock: Instant::now(),
        };
        f(&mut txn)
    }

    fn claim_visible(&self, request: &PollRequest) -> Vec<StepTaskRecord> {
        let mut state = self.state();
        let StoreState { runs, queue, .. } = &mut *state;
        let clock = Instant::now();
        let now = Utc::now();

        let mut claimed = Vec::new();
        let mut stale = Vec::new();

        for msg in queue.values_mut() {
            if claimed.len() >= request.qty {
                break;
            }
            if msg.queue_name != request.queue_name || msg.visible_at > clock {
                continue;
            }

            let Some(run) = runs.get_mut(&msg.run_id) else {
                stale.push(msg.msg_id);
                continue;
            };
            let step_status = run
                .steps
                .get(&msg.key.step_slug)
                .map(|s| s.status)
                .unwrap_or(StepStatus::Created);
            let Some(task) = run.tasks.get_mut(&msg.key) else {
                stale.push(msg.msg_id);
                continue;
            };
            if run.row.status != RunStatus::Started
                || check_task_transition(task.row.status, TaskStatus::Started).is_err()
            {
                stale.push(msg.msg_id);
                continue;
            }

            msg.read_ct += 1;
            msg.visible_at = clock + request.visibility_timeout;
            task.row.status = TaskStatus::Started;
            task.row.started_at = Some(now);
            self.hub
                .publish(ChangeNotification::StepTaskUpdated(task.row.clone()));

            debug!(
                run_id = %msg.run_id,
                step = %msg.key.step_slug,
                task_index = msg.key.task_index,
                read_ct = msg.read_ct,
                "claimed task"
            );

            claimed.push(StepTaskRecord {
                flow_slug: run.row.flow_slug.clone(),
                run_id: msg.run_id,
                step_slug: msg.key.step_slug.clone(),
                task_index: msg.key.task_index,
                input: task.input.clone(),
                message_id: msg.msg_id,
                attempt: task.row.attempts_count + 1,
                step_status,
                timeout: run.flow.retry_policy(&msg.key.step_slug).timeout(),
            });
        }

        for id in stale {
            debug!(msg_id = id, "archiving stale message");
            queue.remove(&id);
        }

        claimed
    }
}

#[async_trait]
impl SqlGateway for MemoryStore {
    async fn start_flow(
        &self,
        flow_slug: &str,
        input: Value,
        run_id: Option<Uuid>,
    ) -> Result<RunRow> {
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let mut state = self.state();

        let flow = state
            .flows
            .get(flow_slug)
            .cloned()
            .ok_or_else(|| PgflowError::FlowNotFound(flow_slug.to_string()))?;
        if state.runs.contains_key(&run_id) {
            return Err(PgflowError::Other(anyhow::anyhow!("run {run_id} already exists")));
        }

        let now = Utc::now();
        let row = RunRow {
            run_id,
            flow_slug: flow.slug().to_string(),
            status: RunStatus::Started,
            input,
            output: None,
            error_message: None,
            remaining_steps: flow.step_count() as u32,
            started_at: Some(now),
            completed_at: None,
            failed_at: None,
        };
        let steps = flow
            .steps()
            .map(|def| {
                let step = StepStateRow {
                    run_id,
                    flow_slug: flow.slug().to_string(),
                    step_slug: def.slug.clone(),
                    step_type: def.step_type,
                    status: StepStatus::Created,
                    remaining_deps: def.depends_on.len() as u32,
                    remaining_tasks: None,
                    initial_tasks: None,
                    output: None,
                    error_message: None,
                    skip_reason: None,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                    failed_at: None,
                    skipped_at: None,
                };
                (def.slug.clone(), step)
            })
            .collect();

        state.runs.insert(
            run_id,
            RunEntry {
                flow: Arc::clone(&flow),
                row,
                steps,
                tasks: BTreeMap::new(),
            },
        );
        drop(state);

        info!(%run_id, flow = %flow_slug, "starting run");

        self.with_run(run_id, |txn| {
            txn.publish_run();
            for slug in txn.run.flow.graph().order().to_vec() {
                if let Some(step) = txn.run.steps.get(&slug) {
                    txn.hub
                        .publish(ChangeNotification::StepStateInserted(step.clone()));
                }
            }
            txn.activate_ready_steps()?;
            Ok(txn.run.row.clone())
        })
    }

    async fn poll_for_tasks(&self, request: &PollRequest) -> Result<Vec<StepTaskRecord>> {
        let deadline = Instant::now() + request.max_poll;
        loop {
            let claimed = self.claim_visible(request);
            let now = Instant::now();
            if !claimed.is_empty() || now >= deadline {
                return Ok(claimed);
            }
            let interval = request
                .poll_interval
                .max(Duration::from_millis(1))
                .min(deadline - now);
            tokio::time::sleep(interval).await;
        }
    }

    async fn complete_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: u32,
        output: Value,
    ) -> Result<StepTaskRow> {
        let key = TaskKey {
            step_slug: step_slug.to_string(),
            task_index,
        };
        self.with_run(run_id, |txn| txn.complete_task(&key, output))
    }

    async fn fail_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: u32,
        error_message: &str,
    ) -> Result<StepTaskRow> {
        let key = TaskKey {
            step_slug: step_slug.to_string(),
            task_index,
        };
        self.with_run(run_id, |txn| txn.fail_task(&key, error_message))
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunSnapshot>> {
        let state = self.state();
        let Some(run) = state.runs.get(&run_id) else {
            return Ok(None);
        };
        let steps = run
            .flow
            .graph()
            .order()
            .iter()
            .filter_map(|slug| run.steps.get(slug).cloned())
            .collect();
        let tasks = run.tasks.values().map(|t| t.row.clone()).collect();
        Ok(Some(RunSnapshot {
            run: run.row.clone(),
            steps,
            tasks,
        }))
    }

    async fn record_heartbeat(&self, worker: &WorkerIdentity) -> Result<HeartbeatAck> {
        let now = Utc::now();
        let mut state = self.state();
        let entry = state
            .workers
            .entry(worker.worker_id)
            .or_insert_with(|| WorkerEntry {
                identity: worker.clone(),
                last_heartbeat_at: now,
                beats: 0,
                deprecated: false,
            });
        entry.last_heartbeat_at = now;
        entry.beats += 1;
        Ok(HeartbeatAck {
            recorded_at: now,
            deprecated: entry.deprecated,
        })
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, run_id: Uuid) -> Result<broadcast::Receiver<ChangeNotification>> {
        Ok(self.hub.subscribe(run_id))
    }
}

/// Mutable view of one run plus the queue, for the duration of one store
/// call.
struct RunTxn<'a> {
    run: &'a mut RunEntry,
    queue: &'a mut BTreeMap<i64, QueuedMessage>,
    next_msg_id: &'a mut i64,
    hub: &'a NotificationHub,
    now: Timestamp,
    clock: Instant,
}

impl RunTxn<'_> {
    fn run_id(&self) -> Uuid {
        self.run.row.run_id
    }

    fn is_active(&self) -> bool {
        self.run.row.status == RunStatus::Started
    }

    fn step_status(&self, slug: &str) -> Option<StepStatus> {
        self.run.steps.get(slug).map(|s| s.status)
    }

    fn step_mut(&mut self, slug: &str) -> Result<&mut StepStateRow> {
        let run_id = self.run_id();
        self.run
            .steps
            .get_mut(slug)
            .ok_or_else(|| PgflowError::StepNotFound {
                run_id,
                step_slug: slug.to_string(),
            })
    }

    fn task_mut(&mut self, key: &TaskKey) -> Result<&mut TaskEntry> {
        let run_id = self.run_id();
        self.run
            .tasks
            .get_mut(key)
            .ok_or_else(|| PgflowError::TaskNotFound {
                run_id,
                step_slug: key.step_slug.clone(),
                task_index: key.task_index,
            })
    }

    fn publish_run(&self) {
        self.hub
            .publish(ChangeNotification::RunUpdated(self.run.row.clone()));
    }

    fn publish_step(&self, slug: &str) {
        if let Some(step) = self.run.steps.get(slug) {
            self.hub
                .publish(ChangeNotification::StepStateUpdated(step.clone()));
        }
    }

    fn decrement_remaining_steps(&mut self) -> Result<()> {
        let run_id = self.run_id();
        let remaining = self.run.row.remaining_steps.checked_sub(1).ok_or_else(|| {
            PgflowError::Other(anyhow::anyhow!(
                "remaining_steps would go negative for run {run_id}"
            ))
        })?;
        self.run.row.remaining_steps = remaining;
        Ok(())
    }

    /// Start every created step whose dependencies are settled, until none
    /// are left, then complete the run if nothing remains.
    fn activate_ready_steps(&mut self) -> Result<()> {
        let flow = Arc::clone(&self.run.flow);
        loop {
            if !self.is_active() {
                return Ok(());
            }
            let ready: Vec<&String> = flow
                .graph()
                .order()
                .iter()
                .filter(|slug| {
                    self.run
                        .steps
                        .get(slug.as_str())
                        .is_some_and(|s| s.status == StepStatus::Created && s.remaining_deps == 0)
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            for slug in ready {
                if !self.is_active() {
                    return Ok(());
                }
                self.activate_step(slug)?;
            }
        }
        self.maybe_complete_run()
    }

    fn activate_step(&mut self, slug: &str) -> Result<()> {
        if self.step_status(slug) != Some(StepStatus::Created) {
            return Ok(());
        }
        let flow = Arc::clone(&self.run.flow);
        let run_id = self.run_id();
        let def = flow.step(slug).ok_or_else(|| PgflowError::StepNotFound {
            run_id,
            step_slug: slug.to_string(),
        })?;

        let input = self.step_input(&def.depends_on);
        if !def.condition_met(&self.condition_subject(&def.depends_on)) {
            info!(%run_id, step = %slug, policy = ?def.else_policy, "step condition not met");
            return match def.else_policy {
                SkipPolicy::Fail => {
                    self.fail_step(slug, &format!("condition for step '{slug}' was not met"))
                }
                SkipPolicy::Skip => self.skip_step(slug, SkipReason::ConditionUnmet, false),
                SkipPolicy::SkipCascade => self.skip_step(slug, SkipReason::ConditionUnmet, true),
            };
        }

        let task_inputs = match def.step_type {
            StepType::Single | StepType::Array => vec![input],
            StepType::Map => match self.map_items(&def.depends_on) {
                None => Vec::new(),
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return self.fail_step(
                        slug,
                        &format!(
                            "map step '{slug}' expects an array input, got {}",
                            json_type(&other)
                        ),
                    );
                }
            },
        };
        let count = task_inputs.len() as u32;
        let now = self.now;

        let step = self.step_mut(slug)?;
        check_transition(step.status, StepStatus::Started)?;
        step.started_at = Some(now);
        step.initial_tasks = Some(count);
        step.remaining_tasks = Some(count);

        if count == 0 {
            step.status = StepStatus::Completed;
            step.completed_at = Some(now);
            step.output = Some(Value::Array(Vec::new()));
            info!(%run_id, step = %slug, "map step has no items; completed without tasks");
            self.publish_step(slug);
            return self.settle_step(slug);
        }

        step.status = StepStatus::Started;
        info!(%run_id, step = %slug, tasks = count, "step started");
        self.publish_step(slug);

        for (index, item) in task_inputs.into_iter().enumerate() {
            self.enqueue_task(slug, index as u32, item);
        }
        Ok(())
    }

    /// `{"run": <flow input>, "<dep>": <dep output>, ...}`; skipped deps are
    /// left out.
    fn step_input(&self, deps: &[String]) -> Value {
        let mut input = Map::new();
        input.insert("run".to_string(), self.run.row.input.clone());
        for dep in deps {
            if let Some(output) = self
                .run
                .steps
                .get(dep)
                .filter(|s| s.status == StepStatus::Completed)
                .and_then(|s| s.output.clone())
            {
                input.insert(dep.clone(), output);
            }
        }
        Value::Object(input)
    }

    /// What an `if` pattern is matched against: the flow input for a root
    /// step, else the completed dependency outputs keyed by slug.
    fn condition_subject(&self, deps: &[String]) -> Value {
        if deps.is_empty() {
            return self.run.row.input.clone();
        }
        let mut outputs = self.step_input(deps);
        if let Value::Object(map) = &mut outputs {
            map.remove("run");
        }
        outputs
    }

    /// Array a map step fans out over: the run input for a root map, else
    /// its dependency's output. `None` when that dependency was skipped.
    fn map_items(&self, deps: &[String]) -> Option<Value> {
        match deps.first() {
            None => Some(self.run.row.input.clone()),
            Some(dep) => self
                .run
                .steps
                .get(dep)
                .filter(|s| s.status == StepStatus::Completed)
                .map(|s| s.output.clone().unwrap_or(Value::Null)),
        }
    }

    fn enqueue_task(&mut self, slug: &str, task_index: u32, input: Value) {
        let msg_id = *self.next_msg_id;
        *self.next_msg_id += 1;

        let key = TaskKey {
            step_slug: slug.to_string(),
            task_index,
        };
        self.queue.insert(
            msg_id,
            QueuedMessage {
                msg_id,
                queue_name: self.run.flow.slug().to_string(),
                run_id: self.run_id(),
                key: key.clone(),
                visible_at: self.clock,
                read_ct: 0,
            },
        );

        let row = StepTaskRow {
            run_id: self.run_id(),
            flow_slug: self.run.row.flow_slug.clone(),
            step_slug: slug.to_string(),
            task_index,
            status: TaskStatus::Queued,
            attempts_count: 0,
            output: None,
            error_message: None,
            message_id: Some(msg_id),
            queued_at: self.now,
            started_at: None,
            completed_at: None,
            failed_at: None,
        };
        self.hub
            .publish(ChangeNotification::StepTaskInserted(row.clone()));
        self.run.tasks.insert(key, TaskEntry { row, input });
    }

    fn archive_message(&mut self, key: &TaskKey) {
        if let Some(msg_id) = self.run.tasks.get(key).and_then(|t| t.row.message_id) {
            self.queue.remove(&msg_id);
        }
    }

    fn archive_step_messages(&mut self, slug: &str) {
        let run_id = self.run_id();
        self.queue
            .retain(|_, m| !(m.run_id == run_id && m.key.step_slug == slug));
    }

    fn requeue_message(&mut self, key: &TaskKey, delay: Duration) {
        let visible_at = self.clock + delay;
        let existing = self
            .run
            .tasks
            .get(key)
            .and_then(|t| t.row.message_id)
            .and_then(|id| self.queue.get_mut(&id));
        if let Some(msg) = existing {
            msg.visible_at = visible_at;
            return;
        }

        let msg_id = *self.next_msg_id;
        *self.next_msg_id += 1;
        self.queue.insert(
            msg_id,
            QueuedMessage {
                msg_id,
                queue_name: self.run.flow.slug().to_string(),
                run_id: self.run_id(),
                key: key.clone(),
                visible_at,
                read_ct: 0,
            },
        );
        if let Some(task) = self.run.tasks.get_mut(key) {
            task.row.message_id = Some(msg_id);
        }
    }

    /// Bookkeeping for a step that completed or was skipped: one fewer
    /// remaining step, one fewer pending dependency for each dependent.
    fn settle_step(&mut self, slug: &str) -> Result<()> {
        self.decrement_remaining_steps()?;
        let flow = Arc::clone(&self.run.flow);
        for dependent in flow.graph().dependents_of(slug) {
            if let Some(step) = self.run.steps.get_mut(dependent) {
                if step.status == StepStatus::Created {
                    step.remaining_deps = step.remaining_deps.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    /// Skip a step. With `cascade`, dependents that have not started are
    /// skipped too (transitively); otherwise they just stop waiting on it.
    fn skip_step(&mut self, slug: &str, reason: SkipReason, cascade: bool) -> Result<()> {
        let flow = Arc::clone(&self.run.flow);
        let run_id = self.run_id();
        let mut stack = vec![(slug.to_string(), reason)];

        while let Some((current, reason)) = stack.pop() {
            let now = self.now;
            let step = self.step_mut(&current)?;
            if step.status.is_terminal() {
                continue;
            }
            check_transition(step.status, StepStatus::Skipped)?;
            step.status = StepStatus::Skipped;
            step.skipped_at = Some(now);
            step.skip_reason = Some(reason);

            info!(%run_id, step = %current, %reason, cascade, "step skipped");
            self.archive_step_messages(&current);
            self.publish_step(&current);
            self.decrement_remaining_steps()?;

            for dependent in flow.graph().dependents_of(&current) {
                let Some(step) = self.run.steps.get_mut(dependent) else {
                    continue;
                };
                if step.status != StepStatus::Created {
                    continue;
                }
                if cascade {
                    stack.push((dependent.clone(), SkipReason::DependencySkipped));
                } else {
                    step.remaining_deps = step.remaining_deps.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    fn fail_step(&mut self, slug: &str, message: &str) -> Result<()> {
        let now = self.now;
        let step = self.step_mut(slug)?;
        check_transition(step.status, StepStatus::Failed)?;
        step.status = StepStatus::Failed;
        step.failed_at = Some(now);
        step.error_message = Some(message.to_string());
        warn!(run_id = %self.run_id(), step = %slug, error = %message, "step failed");
        self.publish_step(slug);
        self.fail_run(message)
    }

    fn fail_run(&mut self, message: &str) -> Result<()> {
        if self.run.row.status.is_terminal() {
            return Ok(());
        }
        check_transition(self.run.row.status, RunStatus::Failed)?;
        self.run.row.status = RunStatus::Failed;
        self.run.row.failed_at = Some(self.now);
        self.run.row.error_message = Some(message.to_string());

        let run_id = self.run_id();
        self.queue.retain(|_, m| m.run_id != run_id);
        warn!(%run_id, error = %message, "run failed");
        self.publish_run();
        Ok(())
    }

    fn maybe_complete_run(&mut self) -> Result<()> {
        if !self.is_active() || self.run.row.remaining_steps > 0 {
            return Ok(());
        }
        check_transition(self.run.row.status, RunStatus::Completed)?;

        let mut output = Map::new();
        for leaf in self.run.flow.graph().leaves() {
            if let Some(step) = self
                .run
                .steps
                .get(leaf)
                .filter(|s| s.status == StepStatus::Completed)
            {
                output.insert(leaf.to_string(), step.output.clone().unwrap_or(Value::Null));
            }
        }

        self.run.row.status = RunStatus::Completed;
        self.run.row.completed_at = Some(self.now);
        self.run.row.output = Some(Value::Object(output));
        info!(run_id = %self.run_id(), "run completed");
        self.publish_run();
        Ok(())
    }

    fn complete_task(&mut self, key: &TaskKey, output: Value) -> Result<StepTaskRow> {
        let run_id = self.run_id();
        let slug = key.step_slug.as_str();
        let current = self.task_mut(key)?.row.clone();

        if current.status.is_terminal() {
            debug!(%run_id, step = %slug, task_index = key.task_index, status = %current.status, "task already settled; ignoring completion");
            return Ok(current);
        }
        if !self.is_active() || self.step_status(slug) != Some(StepStatus::Started) {
            debug!(%run_id, step = %slug, task_index = key.task_index, "run or step no longer active; ignoring completion");
            self.archive_message(key);
            return Ok(current);
        }

        let flow = Arc::clone(&self.run.flow);
        let def = flow.step(slug).ok_or_else(|| PgflowError::StepNotFound {
            run_id,
            step_slug: slug.to_string(),
        })?;
        if def.step_type == StepType::Array && !output.is_array() {
            let message = format!(
                "array step '{slug}' must return a JSON array, got {}",
                json_type(&output)
            );
            return self.fail_task(key, &message);
        }

        let now = self.now;
        let task = self.task_mut(key)?;
        check_task_transition(task.row.status, TaskStatus::Completed)?;
        task.row.status = TaskStatus::Completed;
        task.row.output = Some(output);
        task.row.completed_at = Some(now);
        let row = task.row.clone();

        self.archive_message(key);
        self.hub
            .publish(ChangeNotification::StepTaskUpdated(row.clone()));
        debug!(%run_id, step = %slug, task_index = key.task_index, "task completed");

        let step = self.step_mut(slug)?;
        let remaining = step
            .remaining_tasks
            .unwrap_or(0)
            .checked_sub(1)
            .ok_or_else(|| {
                PgflowError::Other(anyhow::anyhow!(
                    "remaining_tasks would go negative for step '{slug}' in run {run_id}"
                ))
            })?;
        step.remaining_tasks = Some(remaining);
        if remaining > 0 {
            return Ok(row);
        }

        let step_output = match def.step_type {
            StepType::Map => Value::Array(
                self.run
                    .tasks
                    .iter()
                    .filter(|(k, _)| k.step_slug == slug)
                    .map(|(_, t)| t.row.output.clone().unwrap_or(Value::Null))
                    .collect(),
            ),
            StepType::Single | StepType::Array => row.output.clone().unwrap_or(Value::Null),
        };

        let step = self.step_mut(slug)?;
        check_transition(step.status, StepStatus::Completed)?;
        step.status = StepStatus::Completed;
        step.completed_at = Some(now);
        step.output = Some(step_output);
        info!(%run_id, step = %slug, "step completed");
        self.publish_step(slug);

        self.settle_step(slug)?;
        self.activate_ready_steps()?;
        Ok(row)
    }

    fn fail_task(&mut self, key: &TaskKey, message: &str) -> Result<StepTaskRow> {
        let run_id = self.run_id();
        let slug = key.step_slug.as_str();
        let current = self.task_mut(key)?.row.clone();

        if current.status.is_terminal() {
            debug!(%run_id, step = %slug, task_index = key.task_index, status = %current.status, "task already settled; ignoring failure");
            return Ok(current);
        }
        if !self.is_active() || self.step_status(slug) != Some(StepStatus::Started) {
            debug!(%run_id, step = %slug, task_index = key.task_index, "run or step no longer active; ignoring failure");
            self.archive_message(key);
            return Ok(current);
        }

        let flow = Arc::clone(&self.run.flow);
        let def = flow.step(slug).ok_or_else(|| PgflowError::StepNotFound {
            run_id,
            step_slug: slug.to_string(),
        })?;
        let policy = flow.retry_policy(slug);
        let now = self.now;

        let task = self.task_mut(key)?;
        task.row.attempts_count += 1;
        task.row.error_message = Some(message.to_string());
        let attempts = task.row.attempts_count;

        if policy.allows_retry(attempts) {
            if task.row.status != TaskStatus::Queued {
                check_task_transition(task.row.status, TaskStatus::Queued)?;
            }
            task.row.status = TaskStatus::Queued;
            let row = task.row.clone();
            let delay = policy.delay_after(attempts);
            self.requeue_message(key, delay);
            info!(
                %run_id,
                step = %slug,
                task_index = key.task_index,
                attempts,
                delay_secs = delay.as_secs(),
                error = %message,
                "task failed; requeued with backoff"
            );
            self.hub
                .publish(ChangeNotification::StepTaskUpdated(row.clone()));
            return Ok(row);
        }

        check_task_transition(task.row.status, TaskStatus::Failed)?;
        task.row.status = TaskStatus::Failed;
        task.row.failed_at = Some(now);
        let row = task.row.clone();
        self.archive_message(key);
        warn!(
            %run_id,
            step = %slug,
            task_index = key.task_index,
            attempts,
            error = %message,
            "task failed permanently"
        );
        self.hub
            .publish(ChangeNotification::StepTaskUpdated(row.clone()));

        match def.retries_exhausted {
            SkipPolicy::Fail => self.fail_step(slug, message)?,
            SkipPolicy::Skip => {
                self.skip_step(slug, SkipReason::HandlerFailed, false)?;
                self.activate_ready_steps()?;
            }
            SkipPolicy::SkipCascade => {
                self.skip_step(slug, SkipReason::HandlerFailed, true)?;
                self.activate_ready_steps()?;
            }
        }
        Ok(row)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
