// src/client/mod.rs

//! Client side: start runs and observe them.
//!
//! - [`PgflowClient`] starts or attaches to runs and caches the observed
//!   [`FlowRun`]s.
//! - [`subscription`] shares change-feed subscriptions per run.
//! - [`reconciler`] merges snapshots and notifications.
//! - [`run`] / [`step`] are the observed entities; [`events`] their typed
//!   event buses; [`waiter`] the status waits.

pub mod events;
pub mod reconciler;
pub mod run;
pub mod step;
pub mod subscription;
pub mod waiter;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{PgflowError, Result};
use crate::store::{retry_transient, ChangeFeed, SqlGateway};

pub use events::{BusEvent, EventBus, EventStream, RunEvent, RunEventKind, StepEvent, StepEventKind};
pub use reconciler::{Phase, Reconciler};
pub use run::FlowRun;
pub use step::FlowStep;
pub use subscription::{Delivery, SubscriptionHandle, SubscriptionManager};
pub use waiter::WaitOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long notifications are buffered after subscribing before they
    /// are reconciled against the snapshot.
    pub stabilization_delay: Duration,
    /// Pause before re-subscribing after the change feed closes.
    pub reconnect_delay: Duration,
    /// Default timeout for `wait_for_status`.
    pub wait_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stabilization_delay: Duration::from_millis(300),
            reconnect_delay: Duration::from_millis(2000),
            wait_timeout: Duration::from_secs(300),
        }
    }
}

struct ObservedRun {
    run: FlowRun,
    stop: CancellationToken,
    _subscription: SubscriptionHandle,
}

impl ObservedRun {
    fn dispose(self) {
        self.stop.cancel();
        self.run.dispose();
    }
}

pub struct PgflowClient {
    gateway: Arc<dyn SqlGateway>,
    subscriptions: SubscriptionManager,
    config: ClientConfig,
    runs: Mutex<HashMap<Uuid, ObservedRun>>,
}

impl fmt::Debug for PgflowClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgflowClient")
            .field("config", &self.config)
            .field("observed_runs", &self.lock_runs().len())
            .finish_non_exhaustive()
    }
}

impl PgflowClient {
    pub fn new(gateway: Arc<dyn SqlGateway>, feed: Arc<dyn ChangeFeed>, config: ClientConfig) -> Self {
        Self {
            gateway,
            subscriptions: SubscriptionManager::new(feed, config.reconnect_delay),
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<Uuid, ObservedRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run and observe it. The subscription is in place before the
    /// run is created, so every transition after the initial snapshot is
    /// seen.
    pub async fn start_flow(&self, flow_slug: &str, input: Value, run_id: Option<Uuid>) -> Result<FlowRun> {
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let run = self.observe(run_id, Some((flow_slug, input))).await?;
        run.ok_or_else(|| PgflowError::MalformedSnapshot(format!("run {run_id} missing right after start")))
    }

    /// Observe an existing run; `None` if the store does not know it.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<FlowRun>> {
        if let Some(observed) = self.lock_runs().get(&run_id) {
            return Ok(Some(observed.run.clone()));
        }
        self.observe(run_id, None).await
    }

    /// Stop observing a run. Pending waits on it end with `WaitCancelled`.
    pub fn dispose(&self, run_id: Uuid) -> bool {
        let removed = self.lock_runs().remove(&run_id);
        match removed {
            Some(observed) => {
                observed.dispose();
                debug!(%run_id, "disposed run");
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&self) {
        let drained: Vec<_> = self.lock_runs().drain().map(|(_, o)| o).collect();
        for observed in drained {
            observed.dispose();
        }
    }

    pub fn observed_runs(&self) -> Vec<Uuid> {
        self.lock_runs().keys().copied().collect()
    }

    async fn observe(&self, run_id: Uuid, start: Option<(&str, Value)>) -> Result<Option<FlowRun>> {
        let subscription = self.subscriptions.acquire(run_id).await?;
        let subscribed_at = Instant::now();
        let reconciler = Arc::new(Reconciler::new(run_id, self.config.wait_timeout));
        let stop = CancellationToken::new();
        tokio::spawn(consume(
            Arc::clone(&reconciler),
            subscription.deliveries(),
            Arc::clone(&self.gateway),
            stop.clone(),
        ));

        let attached = self.attach(run_id, start, &reconciler, subscribed_at).await;
        let run = match attached {
            Ok(Some(run)) => run,
            Ok(None) => {
                stop.cancel();
                return Ok(None);
            }
            Err(err) => {
                stop.cancel();
                return Err(err);
            }
        };

        let mut runs = self.lock_runs();
        if let Some(existing) = runs.get(&run_id) {
            // Someone else attached first; keep theirs.
            stop.cancel();
            run.dispose();
            return Ok(Some(existing.run.clone()));
        }
        runs.insert(
            run_id,
            ObservedRun {
                run: run.clone(),
                stop,
                _subscription: subscription,
            },
        );
        Ok(Some(run))
    }

    async fn attach(
        &self,
        run_id: Uuid,
        start: Option<(&str, Value)>,
        reconciler: &Reconciler,
        subscribed_at: Instant,
    ) -> Result<Option<FlowRun>> {
        if let Some((flow_slug, input)) = start {
            let row = self.gateway.start_flow(flow_slug, input, Some(run_id)).await?;
            info!(%run_id, flow = %flow_slug, status = %row.status, "run started");
        }

        let snapshot = retry_transient("get_run", || self.gateway.get_run(run_id)).await?;
        let Some(snapshot) = snapshot else {
            return Ok(None);
        };
        let run = reconciler.apply_snapshot(snapshot)?;

        tokio::time::sleep_until(subscribed_at + self.config.stabilization_delay).await;
        let replayed = reconciler.go_live()?;
        debug!(%run_id, replayed, status = %run.status(), "observing run");
        Ok(Some(run))
    }
}

impl Drop for PgflowClient {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

/// Feed deliveries into the reconciler until stopped. Resync requests and
/// local lag both re-read the snapshot.
async fn consume(
    reconciler: Arc<Reconciler>,
    mut deliveries: broadcast::Receiver<Delivery>,
    gateway: Arc<dyn SqlGateway>,
    stop: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            delivery = deliveries.recv() => delivery,
        };
        match delivery {
            Ok(Delivery::Notification(notification)) => {
                reconciler.handle(notification);
            }
            Ok(Delivery::Resync) => refresh(&reconciler, gateway.as_ref()).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(run_id = %reconciler.run_id(), skipped, "notification consumer lagged; refreshing");
                refresh(&reconciler, gateway.as_ref()).await;
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn refresh(reconciler: &Reconciler, gateway: &dyn SqlGateway) {
    let run_id = reconciler.run_id();
    match retry_transient("get_run", || gateway.get_run(run_id)).await {
        Ok(Some(snapshot)) => {
            if let Err(err) = reconciler.apply_snapshot(snapshot) {
                warn!(%run_id, error = %err, "could not apply refreshed snapshot");
            }
        }
        Ok(None) => warn!(%run_id, "run disappeared from the store"),
        Err(err) => warn!(%run_id, error = %err, "snapshot refresh failed"),
    }
}
