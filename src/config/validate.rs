// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{PgflowError, Result};
use crate::flow::{Flow, RetryPolicy};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::PgflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_steps(&raw)?;
        validate_worker_section(&raw)?;
        validate_client_section(&raw)?;
        let flow = compile_flow(&raw)?;
        Ok(ConfigFile::new_unchecked(raw, flow))
    }
}

fn ensure_has_steps(cfg: &RawConfigFile) -> Result<()> {
    if cfg.step.is_empty() {
        return Err(PgflowError::ConfigError(
            "config must contain at least one [step.<slug>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_worker_section(cfg: &RawConfigFile) -> Result<()> {
    let w = &cfg.worker;
    for (name, value) in [
        ("max_concurrent", w.max_concurrent as u64),
        ("batch_size", w.batch_size as u64),
        ("visibility_timeout", w.visibility_timeout),
        ("poll_interval_ms", w.poll_interval_ms),
        ("heartbeat_interval_ms", w.heartbeat_interval_ms),
    ] {
        if value == 0 {
            return Err(PgflowError::ConfigError(format!(
                "[worker].{name} must be >= 1 (got 0)"
            )));
        }
    }
    if let Some(queue) = &w.queue_name {
        if queue.trim().is_empty() {
            return Err(PgflowError::ConfigError(
                "[worker].queue_name must not be empty".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_client_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.client.wait_timeout_ms == 0 {
        return Err(PgflowError::ConfigError(
            "[client].wait_timeout_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

/// Build the flow; DAG shape and retry settings are checked by [`Flow::new`].
fn compile_flow(cfg: &RawConfigFile) -> Result<Flow> {
    let f = &cfg.flow;
    let defaults = RetryPolicy {
        max_attempts: f.max_attempts,
        base_delay: f.base_delay,
        timeout: f.timeout,
        strategy: f.strategy.unwrap_or_default(),
        max_delay: f.max_delay,
    };
    let steps = cfg
        .step
        .iter()
        .map(|(slug, step)| step.to_definition(slug))
        .collect();
    Flow::new(f.slug.clone(), defaults, steps)
}
