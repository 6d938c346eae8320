use std::collections::BTreeMap;
use std::time::Duration;

use pgflow::client::ClientConfig;
use pgflow::config::{ClientSection, ConfigFile, FlowSection, RawConfigFile, StepConfig, WorkerSection};
use pgflow::flow::{Flow, RetryPolicy, SkipPolicy, StepDefinition, StepType};
use pgflow::worker::{WorkerConfig, WorkerMode};
use serde_json::Value;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new(flow_slug: &str) -> Self {
        Self {
            config: RawConfigFile {
                worker: WorkerSection::default(),
                client: ClientSection::default(),
                flow: FlowSection {
                    slug: flow_slug.to_string(),
                    max_attempts: 3,
                    base_delay: 1,
                    timeout: 60,
                    strategy: None,
                    max_delay: None,
                },
                step: BTreeMap::new(),
            },
        }
    }

    pub fn with_step(mut self, slug: &str, step: StepConfig) -> Self {
        self.config.step.insert(slug.to_string(), step);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.flow.max_attempts = n;
        self
    }

    pub fn base_delay(mut self, secs: u64) -> Self {
        self.config.flow.base_delay = secs;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.worker.max_concurrent = n;
        self
    }

    pub fn mode(mut self, mode: WorkerMode) -> Self {
        self.config.worker.mode = mode;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

/// Builder for `StepConfig`.
pub struct StepConfigBuilder {
    step: StepConfig,
}

impl StepConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            step: StepConfig {
                step_type: StepType::Single,
                depends_on: vec![],
                cmd: Some(cmd.to_string()),
                max_attempts: None,
                base_delay: None,
                timeout: None,
                strategy: None,
                max_delay: None,
                condition: None,
                else_policy: SkipPolicy::Fail,
                retries_exhausted: SkipPolicy::Fail,
            },
        }
    }

    pub fn step_type(mut self, step_type: StepType) -> Self {
        self.step.step_type = step_type;
        self
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.step.depends_on.push(dep.to_string());
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.step.max_attempts = Some(n);
        self
    }

    pub fn run_if(mut self, pattern: Value, else_policy: SkipPolicy) -> Self {
        self.step.condition = Some(pattern);
        self.step.else_policy = else_policy;
        self
    }

    pub fn retries_exhausted(mut self, policy: SkipPolicy) -> Self {
        self.step.retries_exhausted = policy;
        self
    }

    pub fn build(self) -> StepConfig {
        self.step
    }
}

/// Build a flow with default retry settings, panicking on invalid input.
pub fn flow(slug: &str, steps: Vec<StepDefinition>) -> Flow {
    Flow::new(slug, RetryPolicy::default(), steps).expect("invalid test flow")
}

/// Build a flow with the given defaults.
pub fn flow_with(slug: &str, defaults: RetryPolicy, steps: Vec<StepDefinition>) -> Flow {
    Flow::new(slug, defaults, steps).expect("invalid test flow")
}

/// Worker settings tuned for tests: short long-poll and quick heartbeats.
pub fn fast_worker_config(queue_name: &str) -> WorkerConfig {
    WorkerConfig {
        max_poll_seconds: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(100),
        ..WorkerConfig::for_queue(queue_name)
    }
}

/// Client settings tuned for tests.
pub fn fast_client_config() -> ClientConfig {
    ClientConfig {
        stabilization_delay: Duration::from_millis(20),
        reconnect_delay: Duration::from_millis(50),
        wait_timeout: Duration::from_secs(30),
    }
}
