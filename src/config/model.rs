// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::client::ClientConfig;
use crate::flow::{Flow, RetryStrategy, SkipPolicy, StepDefinition, StepOptions, StepType};
use crate::worker::{WorkerConfig, WorkerMode};

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [worker]
/// max_concurrent = 4
///
/// [flow]
/// slug = "analyze_website"
/// max_attempts = 3
///
/// [step.fetch]
/// cmd = "curl -s \"$(jq -r .run.url)\""
///
/// [step.summarize]
/// depends_on = ["fetch"]
/// cmd = "jq '{summary: .fetch | length}'"
/// retries_exhausted = "skip"
/// ```
///
/// Every section except `[flow]` and at least one `[step.<slug>]` is
/// optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub worker: WorkerSection,

    #[serde(default)]
    pub client: ClientSection,

    pub flow: FlowSection,

    /// Keys are step slugs.
    #[serde(default)]
    pub step: BTreeMap<String, StepConfig>,
}

/// A validated configuration. Built through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub worker: WorkerSection,
    pub client: ClientSection,
    pub flow: FlowSection,
    pub step: BTreeMap<String, StepConfig>,
    compiled: Flow,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile, compiled: Flow) -> Self {
        Self {
            worker: raw.worker,
            client: raw.client,
            flow: raw.flow,
            step: raw.step,
            compiled,
        }
    }

    /// The flow described by `[flow]` + `[step.*]`.
    pub fn compiled_flow(&self) -> &Flow {
        &self.compiled
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let w = &self.worker;
        WorkerConfig {
            queue_name: w
                .queue_name
                .clone()
                .unwrap_or_else(|| self.flow.slug.clone()),
            max_concurrent: w.max_concurrent,
            batch_size: w.batch_size,
            visibility_timeout: Duration::from_secs(w.visibility_timeout),
            max_poll_seconds: Duration::from_secs(w.max_poll_seconds),
            poll_interval: Duration::from_millis(w.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(w.heartbeat_interval_ms),
            mode: w.mode,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let c = &self.client;
        ClientConfig {
            stabilization_delay: Duration::from_millis(c.stabilization_delay_ms),
            reconnect_delay: Duration::from_millis(c.reconnect_delay_ms),
            wait_timeout: Duration::from_millis(c.wait_timeout_ms),
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Defaults to the flow slug.
    #[serde(default)]
    pub queue_name: Option<String>,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: u64,

    #[serde(default = "default_max_poll_seconds")]
    pub max_poll_seconds: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// `"continuous"` (default) or `"single-cycle"`.
    #[serde(default)]
    pub mode: WorkerMode,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_batch_size() -> usize {
    10
}

fn default_visibility_timeout() -> u64 {
    2
}

fn default_max_poll_seconds() -> u64 {
    2
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            queue_name: None,
            max_concurrent: default_max_concurrent(),
            batch_size: default_batch_size(),
            visibility_timeout: default_visibility_timeout(),
            max_poll_seconds: default_max_poll_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            mode: WorkerMode::default(),
        }
    }
}

/// `[client]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_stabilization_delay_ms")]
    pub stabilization_delay_ms: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

fn default_stabilization_delay_ms() -> u64 {
    300
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

fn default_wait_timeout_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            stabilization_delay_ms: default_stabilization_delay_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

/// `[flow]` section: slug and default retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowSection {
    pub slug: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,

    /// Seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub strategy: Option<RetryStrategy>,

    #[serde(default)]
    pub max_delay: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1
}

fn default_timeout() -> u64 {
    60
}

/// `[step.<slug>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    #[serde(default, rename = "type")]
    pub step_type: StepType,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Shell command run by the CLI worker for this step.
    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub base_delay: Option<u64>,

    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub strategy: Option<RetryStrategy>,

    #[serde(default)]
    pub max_delay: Option<u64>,

    /// Pattern the flow input (root steps) or the dependency outputs must
    /// contain, e.g. `if = { fetch = { tier = "pro" } }`.
    #[serde(default, rename = "if")]
    pub condition: Option<Value>,

    #[serde(default, rename = "else")]
    pub else_policy: SkipPolicy,

    #[serde(default)]
    pub retries_exhausted: SkipPolicy,
}

impl StepConfig {
    pub fn to_definition(&self, slug: &str) -> StepDefinition {
        StepDefinition {
            slug: slug.to_string(),
            step_type: self.step_type,
            depends_on: self.depends_on.clone(),
            options: StepOptions {
                max_attempts: self.max_attempts,
                base_delay: self.base_delay,
                timeout: self.timeout,
                strategy: self.strategy,
                max_delay: self.max_delay,
            },
            condition: self.condition.clone(),
            else_policy: self.else_policy,
            retries_exhausted: self.retries_exhausted,
        }
    }
}
