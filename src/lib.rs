// src/lib.rs

pub mod cli;
pub mod client;
pub mod config;
pub mod errors;
pub mod flow;
pub mod logging;
pub mod state;
pub mod store;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::client::{EventStream, FlowRun, PgflowClient, RunEvent, StepEvent, WaitOptions};
use crate::config::loader::{default_config_path, load_and_validate};
use crate::config::model::ConfigFile;
use crate::errors::PgflowError;
use crate::state::{Lifecycle, RunStatus};
use crate::store::{ChangeFeed, MemoryStore, SqlGateway};
use crate::worker::{CommandHandler, HandlerRegistry, Worker, WorkerMode};

/// How a CLI run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error_message: Option<String>,
}

impl RunOutcome {
    /// Dry runs and completed runs count as success.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - an in-process store with the configured flow registered
/// - a worker running each step's `cmd`
/// - a client that starts the run and streams its events to STDOUT
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<RunOutcome> {
    let config_path = args
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(RunOutcome {
            status: RunStatus::Completed,
            output: None,
            error_message: None,
        });
    }

    let input: Value = serde_json::from_str(&args.input).context("--input is not valid JSON")?;

    let store = Arc::new(MemoryStore::new());
    let flow = store.register_flow(cfg.compiled_flow().clone());

    let handlers = command_handlers(&cfg);
    let mut worker_config = cfg.worker_config();
    if args.once {
        worker_config.mode = WorkerMode::SingleCycle;
    }

    let gateway: Arc<dyn SqlGateway> = store.clone();
    let feed: Arc<dyn ChangeFeed> = store.clone();
    let worker = Worker::new(Arc::clone(&gateway), handlers, worker_config);
    worker.start()?;

    let client = PgflowClient::new(gateway, feed, cfg.client_config());
    let outcome = drive(&client, flow.slug(), input).await;

    let report = worker.stop().await?;
    debug!(?report, stats = ?worker.stats(), "worker drained");
    client.dispose_all();
    outcome
}

/// Start the run, print its events and wait until it is terminal or the user
/// hits Ctrl-C.
async fn drive(client: &PgflowClient, flow_slug: &str, input: Value) -> Result<RunOutcome> {
    let run = client.start_flow(flow_slug, input, None).await?;
    info!(run_id = %run.run_id(), flow = %flow_slug, "run started");
    print_json(&run.row());

    let mut printer = tokio::spawn(forward_events(run.subscribe(), run.subscribe_steps(), |line| {
        println!("{line}")
    }));

    let finished = tokio::select! {
        res = wait_until_terminal(&run) => {
            if let Err(err) = res {
                debug!(error = %err, "run did not complete");
            }
            run.status().is_terminal()
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run.run_id(), "interrupted; stopping");
            false
        }
    };
    if finished {
        // The printer stops on its own after the terminal run event.
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut printer).await;
    }
    printer.abort();

    for step in run.steps() {
        print_json(&step.row());
    }
    print_json(&run.row());

    Ok(RunOutcome {
        status: run.status(),
        output: run.output(),
        error_message: run.error_message(),
    })
}

/// Waits for completion; the client's wait timeout only triggers a progress
/// log line.
async fn wait_until_terminal(run: &FlowRun) -> errors::Result<()> {
    loop {
        match run.wait_for_status(RunStatus::Completed, WaitOptions::default()).await {
            Err(PgflowError::WaitTimeout { .. }) => {
                info!(run_id = %run.run_id(), remaining_steps = run.remaining_steps(), "still running");
            }
            other => return other.map(|_| ()),
        }
    }
}

/// One JSON line per run or step event, until the run event stream reports
/// a terminal event. Step events already queued by then are still emitted.
async fn forward_events(
    mut run_events: EventStream<RunEvent>,
    mut step_events: EventStream<StepEvent>,
    mut emit: impl FnMut(String),
) {
    loop {
        tokio::select! {
            biased;
            event = step_events.recv() => match event {
                Some(event) => emit_json(&event, &mut emit),
                None => return,
            },
            event = run_events.recv() => match event {
                Some(event) => {
                    let terminal = event.is_terminal();
                    emit_json(&event, &mut emit);
                    if terminal {
                        break;
                    }
                }
                None => return,
            },
        }
    }
    for event in step_events.drain() {
        emit_json(&event, &mut emit);
    }
}

fn emit_json<T: serde::Serialize>(value: &T, emit: &mut impl FnMut(String)) {
    match serde_json::to_string(value) {
        Ok(line) => emit(line),
        Err(err) => warn!(error = %err, "could not serialize event"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    emit_json(value, &mut |line| println!("{line}"));
}

/// A [`CommandHandler`] for every step that has a `cmd`. Steps without one
/// fail when their tasks run.
fn command_handlers(cfg: &ConfigFile) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    for (slug, step) in &cfg.step {
        match &step.cmd {
            Some(cmd) => handlers.register(slug.clone(), Arc::new(CommandHandler::new(cmd.clone()))),
            None => warn!(step = %slug, "step has no cmd; its tasks will fail"),
        }
    }
    handlers
}

/// Simple dry-run output: flow defaults, then every step in topological order.
fn print_dry_run(cfg: &ConfigFile) {
    let flow = cfg.compiled_flow();
    let worker = cfg.worker_config();
    println!("pgflow dry-run");
    println!("  flow = {}", flow.slug());
    println!("  defaults = {:?}", flow.defaults());
    println!(
        "  worker.queue_name = {}, max_concurrent = {}, mode = {:?}",
        worker.queue_name, worker.max_concurrent, worker.mode
    );
    println!();

    println!("steps ({}):", flow.step_count());
    for slug in flow.graph().order() {
        let Some(step) = flow.step(slug) else {
            continue;
        };
        println!("  - {slug} ({})", step.step_type);
        if let Some(cmd) = cfg.step.get(slug).and_then(|s| s.cmd.as_deref()) {
            println!("      cmd: {cmd}");
        }
        if !step.depends_on.is_empty() {
            println!("      depends_on: {:?}", step.depends_on);
        }
        if let Some(ref condition) = step.condition {
            println!("      if: {condition} (else {:?})", step.else_policy);
        }
        println!("      retry: {:?}", flow.retry_policy(slug));
    }

    debug!("dry-run complete (no execution)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::flow::{Flow, RetryPolicy, StepDefinition};
    use crate::store::PollRequest;
    use serde_json::json;

    #[tokio::test]
    async fn events_before_the_forwarder_first_runs_are_kept() {
        let store = Arc::new(MemoryStore::new());
        store.register_flow(Flow::new("one", RetryPolicy::default(), vec![StepDefinition::single("a")]).unwrap());
        let gateway: Arc<dyn SqlGateway> = store.clone();
        let feed: Arc<dyn ChangeFeed> = store.clone();
        let client = PgflowClient::new(
            Arc::clone(&gateway),
            feed,
            ClientConfig {
                stabilization_delay: Duration::from_millis(10),
                ..ClientConfig::default()
            },
        );

        let run = client.start_flow("one", json!({}), None).await.unwrap();
        let mut lines = Vec::new();
        let forwarder = forward_events(run.subscribe(), run.subscribe_steps(), |line| lines.push(line));

        // The whole run finishes before the forwarder is first polled.
        let tasks = gateway
            .poll_for_tasks(&PollRequest {
                queue_name: "one".into(),
                visibility_timeout: Duration::from_secs(30),
                qty: 1,
                max_poll: Duration::from_secs(1),
                poll_interval: Duration::from_millis(10),
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        gateway.complete_task(run.run_id(), "a", 0, json!(1)).await.unwrap();
        run.wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), forwarder)
            .await
            .expect("forwarder should stop after the run completes");

        let kinds: Vec<String> = lines
            .iter()
            .map(|line| {
                let value: Value = serde_json::from_str(line).unwrap();
                value["event_type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(kinds, ["step:completed", "run:completed"]);
        client.dispose_all();
    }
}
