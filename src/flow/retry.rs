// src/flow/retry.rs

//! Retry backoff computation and retry-setting validation.

use std::time::Duration;

use serde::Deserialize;

use crate::errors::{PgflowError, Result};

/// Largest value accepted for any retry setting (fits a signed 32-bit column).
pub const MAX_RETRY_VALUE: u64 = 2_147_483_647;
/// Upper bound on attempts for the exponential strategy.
pub const MAX_EXPONENTIAL_ATTEMPTS: u32 = 50;
/// Cap applied to exponential delays when no `max_delay` is configured.
pub const DEFAULT_MAX_DELAY_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// Effective retry settings for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first execution.
    pub max_attempts: u32,
    /// Seconds.
    pub base_delay: u64,
    /// Seconds a single execution may run before it is failed.
    pub timeout: u64,
    pub strategy: RetryStrategy,
    /// Seconds; only meaningful for [`RetryStrategy::Exponential`].
    pub max_delay: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1,
            timeout: 60,
            strategy: RetryStrategy::Fixed,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts_count` failures.
    pub fn delay_after(&self, attempts_count: u32) -> Duration {
        Duration::from_secs(retry_config(
            self.base_delay,
            attempts_count,
            self.strategy,
            self.max_delay,
        ))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Whether a task with `attempts_count` recorded failures may run again.
    pub fn allows_retry(&self, attempts_count: u32) -> bool {
        attempts_count < self.max_attempts
    }
}

/// Backoff in seconds for the attempt that just failed.
///
/// Fixed: `base_delay`. Exponential: `base_delay * 2^(attempts_count - 1)`,
/// capped at `max_delay` (default [`DEFAULT_MAX_DELAY_SECS`]).
pub fn retry_config(
    base_delay: u64,
    attempts_count: u32,
    strategy: RetryStrategy,
    max_delay: Option<u64>,
) -> u64 {
    match strategy {
        RetryStrategy::Fixed => base_delay,
        RetryStrategy::Exponential => {
            let exponent = attempts_count.saturating_sub(1).min(63);
            let factor = 1u64 << exponent;
            base_delay
                .saturating_mul(factor)
                .min(max_delay.unwrap_or(DEFAULT_MAX_DELAY_SECS))
        }
    }
}

/// Validate a retry policy before it is used by a store or worker.
pub fn validate_retry_policy(policy: &RetryPolicy) -> Result<()> {
    let invalid = |msg: String| Err(PgflowError::InvalidRetryConfig(msg));

    if policy.base_delay == 0 {
        return invalid("base_delay must be greater than 0".to_string());
    }
    for (name, value) in [
        ("max_attempts", u64::from(policy.max_attempts)),
        ("base_delay", policy.base_delay),
        ("timeout", policy.timeout),
        ("max_delay", policy.max_delay.unwrap_or(0)),
    ] {
        if value > MAX_RETRY_VALUE {
            return invalid(format!("{name} must not exceed {MAX_RETRY_VALUE} (got {value})"));
        }
    }

    match policy.strategy {
        RetryStrategy::Fixed => {
            if policy.max_delay.is_some() {
                return invalid("max_delay is only supported by the exponential strategy".to_string());
            }
        }
        RetryStrategy::Exponential => {
            if policy.max_attempts > MAX_EXPONENTIAL_ATTEMPTS {
                return invalid(format!(
                    "max_attempts must be at most {MAX_EXPONENTIAL_ATTEMPTS} for the exponential strategy (got {})",
                    policy.max_attempts
                ));
            }
            if let Some(max_delay) = policy.max_delay {
                if max_delay < policy.base_delay {
                    return invalid(format!(
                        "max_delay ({max_delay}) must be greater than or equal to base_delay ({})",
                        policy.base_delay
                    ));
                }
            }
        }
    }

    Ok(())
}
