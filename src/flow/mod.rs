// src/flow/mod.rs

//! Compiled flow definitions.
//!
//! - [`graph`] holds the validated step DAG.
//! - [`retry`] computes retry backoff and validates retry settings.
//!
//! A [`Flow`] is immutable once built; stores and workers share it behind an
//! `Arc`.

pub mod graph;
pub mod retry;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{PgflowError, Result};

pub use graph::FlowGraph;
pub use retry::{retry_config, validate_retry_policy, RetryPolicy, RetryStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// One task, any JSON output.
    #[default]
    Single,
    /// One task per element of the input array; output is the ordered array
    /// of task outputs.
    Map,
    /// One task that must return a JSON array.
    Array,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepType::Single => "single",
            StepType::Map => "map",
            StepType::Array => "array",
        };
        f.write_str(s)
    }
}

/// What happens when a step's condition is unmet or its retries run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipPolicy {
    /// Fail the step and the run.
    #[default]
    Fail,
    /// Skip the step; dependents run without its output.
    Skip,
    /// Skip the step and every dependent that has not started yet.
    SkipCascade,
}

impl SkipPolicy {
    /// `skip` and `skip-cascade` make this step's output optional downstream.
    pub fn output_optional(self) -> bool {
        !matches!(self, SkipPolicy::Fail)
    }
}

/// Per-step overrides of the flow's default retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOptions {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<u64>,
    pub timeout: Option<u64>,
    pub strategy: Option<RetryStrategy>,
    pub max_delay: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub slug: String,
    pub step_type: StepType,
    pub depends_on: Vec<String>,
    pub options: StepOptions,
    /// JSON pattern the step input must contain for the step to run.
    pub condition: Option<Value>,
    pub else_policy: SkipPolicy,
    pub retries_exhausted: SkipPolicy,
}

impl StepDefinition {
    pub fn new(slug: impl Into<String>, step_type: StepType) -> Self {
        Self {
            slug: slug.into(),
            step_type,
            depends_on: Vec::new(),
            options: StepOptions::default(),
            condition: None,
            else_policy: SkipPolicy::Fail,
            retries_exhausted: SkipPolicy::Fail,
        }
    }

    pub fn single(slug: impl Into<String>) -> Self {
        Self::new(slug, StepType::Single)
    }

    pub fn map(slug: impl Into<String>) -> Self {
        Self::new(slug, StepType::Map)
    }

    pub fn array(slug: impl Into<String>) -> Self {
        Self::new(slug, StepType::Array)
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.options.max_attempts = Some(n);
        self
    }

    pub fn base_delay(mut self, secs: u64) -> Self {
        self.options.base_delay = Some(secs);
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.options.timeout = Some(secs);
        self
    }

    pub fn exponential(mut self, max_delay: Option<u64>) -> Self {
        self.options.strategy = Some(RetryStrategy::Exponential);
        self.options.max_delay = max_delay;
        self
    }

    /// Only run when the step input contains `pattern`; otherwise apply
    /// `else_policy`.
    pub fn run_if(mut self, pattern: Value, else_policy: SkipPolicy) -> Self {
        self.condition = Some(pattern);
        self.else_policy = else_policy;
        self
    }

    pub fn on_retries_exhausted(mut self, policy: SkipPolicy) -> Self {
        self.retries_exhausted = policy;
        self
    }

    pub fn is_map(&self) -> bool {
        self.step_type == StepType::Map
    }

    /// Whether `input` satisfies the step's condition. Steps without a
    /// condition always run.
    pub fn condition_met(&self, input: &Value) -> bool {
        self.condition
            .as_ref()
            .is_none_or(|pattern| json_contains(input, pattern))
    }
}

/// JSON containment: every key of a pattern object must be present and
/// contain the pattern's value, every element of a pattern array must be
/// contained in some element of the target array, scalars compare equal.
pub fn json_contains(target: &Value, pattern: &Value) -> bool {
    match (target, pattern) {
        (Value::Object(t), Value::Object(p)) => p
            .iter()
            .all(|(k, pv)| t.get(k).is_some_and(|tv| json_contains(tv, pv))),
        (Value::Array(t), Value::Array(p)) => p
            .iter()
            .all(|pv| t.iter().any(|tv| json_contains(tv, pv))),
        (t, p) => t == p,
    }
}

/// A validated flow: slug, default retry policy and step DAG.
#[derive(Debug, Clone)]
pub struct Flow {
    slug: String,
    defaults: RetryPolicy,
    steps: Vec<StepDefinition>,
    graph: FlowGraph,
}

impl Flow {
    /// Validate and build a flow.
    ///
    /// Fails on an empty slug, no steps, an invalid DAG, map steps with more
    /// than one dependency, or invalid retry settings (defaults and every
    /// step's effective policy).
    pub fn new(
        slug: impl Into<String>,
        defaults: RetryPolicy,
        steps: Vec<StepDefinition>,
    ) -> Result<Self> {
        let slug = slug.into();
        if slug.trim().is_empty() {
            return Err(PgflowError::ConfigError("flow slug must not be empty".to_string()));
        }
        if steps.is_empty() {
            return Err(PgflowError::ConfigError(format!(
                "flow '{slug}' must contain at least one step"
            )));
        }

        let graph = FlowGraph::from_steps(&steps)?;

        for step in &steps {
            if step.is_map() && step.depends_on.len() > 1 {
                return Err(PgflowError::ConfigError(format!(
                    "map step '{}' can depend on at most one step (got {})",
                    step.slug,
                    step.depends_on.len()
                )));
            }
        }

        validate_retry_policy(&defaults)?;
        let flow = Self {
            slug,
            defaults,
            steps,
            graph,
        };
        for step in &flow.steps {
            validate_retry_policy(&flow.retry_policy(&step.slug))
                .map_err(|e| PgflowError::InvalidRetryConfig(format!("step '{}': {e}", step.slug)))?;
        }

        Ok(flow)
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn defaults(&self) -> &RetryPolicy {
        &self.defaults
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter()
    }

    pub fn step(&self, slug: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.slug == slug)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Flow defaults with the step's overrides applied. Unknown slugs get the
    /// defaults.
    pub fn retry_policy(&self, step_slug: &str) -> RetryPolicy {
        let Some(step) = self.step(step_slug) else {
            return self.defaults;
        };
        let o = &step.options;
        let strategy = o.strategy.unwrap_or(self.defaults.strategy);
        RetryPolicy {
            max_attempts: o.max_attempts.unwrap_or(self.defaults.max_attempts),
            base_delay: o.base_delay.unwrap_or(self.defaults.base_delay),
            timeout: o.timeout.unwrap_or(self.defaults.timeout),
            strategy,
            max_delay: match strategy {
                RetryStrategy::Fixed => None,
                RetryStrategy::Exponential => o.max_delay.or(self.defaults.max_delay),
            },
        }
    }
}
