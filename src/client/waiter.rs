// src/client/waiter.rs

//! Waiting for an observed entity to reach a status.
//!
//! A wait resolves as soon as the entity is at the target or past it in the
//! `created -> started -> terminal` order. It fails straight away if the
//! entity settled in a different terminal status, and otherwise ends with a
//! timeout, an external cancellation, or disposal of the entity. Each waiter
//! holds its own `watch` receiver, so any number of waits can run on the
//! same entity and nothing outlives the call.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{PgflowError, Result};
use crate::state::{reach, Lifecycle, Reach};

#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Overrides the client's default wait timeout.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl WaitOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub(crate) async fn wait_for_status<S>(
    mut status: watch::Receiver<S>,
    target: S,
    options: WaitOptions,
    default_timeout: Duration,
    disposed: &CancellationToken,
) -> Result<S>
where
    S: Lifecycle + Send + Sync,
{
    let timeout = options.timeout.unwrap_or(default_timeout);
    let deadline = Instant::now() + timeout;
    let cancel = options.cancel.unwrap_or_default();

    loop {
        let current = *status.borrow_and_update();
        match reach(current, target) {
            Reach::Reached => return Ok(current),
            Reach::Unreachable => {
                return Err(PgflowError::StatusUnreachable {
                    target: target.to_string(),
                    current: current.to_string(),
                });
            }
            Reach::Pending => {}
        }

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return Err(PgflowError::Subscription(format!(
                        "{} went away while waiting for '{target}'",
                        S::ENTITY
                    )));
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!(entity = S::ENTITY, %target, timeout_ms = timeout.as_millis() as u64, "wait timed out");
                return Err(PgflowError::WaitTimeout {
                    target: target.to_string(),
                    timeout_ms: timeout.as_millis(),
                });
            }
            _ = cancel.cancelled() => {
                return Err(PgflowError::WaitCancelled { target: target.to_string() });
            }
            _ = disposed.cancelled() => {
                return Err(PgflowError::WaitCancelled { target: target.to_string() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunStatus, StepStatus};

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn resolves_on_reaching_or_passing_the_target() {
        let (tx, rx) = watch::channel(StepStatus::Completed);
        let disposed = CancellationToken::new();
        let got = wait_for_status(rx, StepStatus::Started, WaitOptions::default(), LONG, &disposed)
            .await
            .unwrap();
        assert_eq!(got, StepStatus::Completed);

        let rx = tx.subscribe();
        tx.send_replace(StepStatus::Created);
        let waiting = tokio::spawn({
            let disposed = disposed.clone();
            async move { wait_for_status(rx, StepStatus::Completed, WaitOptions::default(), LONG, &disposed).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send_replace(StepStatus::Started);
        tx.send_replace(StepStatus::Completed);
        assert_eq!(waiting.await.unwrap().unwrap(), StepStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn other_terminal_status_is_unreachable() {
        let (_tx, rx) = watch::channel(RunStatus::Failed);
        let err = wait_for_status(rx, RunStatus::Completed, WaitOptions::default(), LONG, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PgflowError::StatusUnreachable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_cancels() {
        let (tx, rx) = watch::channel(RunStatus::Started);
        let disposed = CancellationToken::new();
        let err = wait_for_status(rx, RunStatus::Completed, WaitOptions::timeout(Duration::from_millis(100)), LONG, &disposed)
            .await
            .unwrap_err();
        assert!(matches!(err, PgflowError::WaitTimeout { timeout_ms: 100, .. }));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_for_status(
            tx.subscribe(),
            RunStatus::Completed,
            WaitOptions::default().with_cancel(cancel),
            LONG,
            &disposed,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PgflowError::WaitCancelled { .. }));
    }
}
