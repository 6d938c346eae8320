// src/client/subscription.rs

//! Reference-counted change-feed subscriptions, one upstream per run.
//!
//! Every [`SubscriptionHandle`] for a run shares one upstream receiver. A
//! background pump forwards upstream notifications to the handles; when the
//! upstream closes it re-subscribes after the reconnect delay and emits
//! [`Delivery::Resync`] so consumers re-read the snapshot for anything
//! missed in between. The pump (and the upstream receiver) go away when the
//! last handle for the run is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::store::{ChangeFeed, ChangeNotification};

pub const DEFAULT_DELIVERY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Notification(ChangeNotification),
    /// Notifications may have been missed; re-read the snapshot.
    Resync,
}

struct Channel {
    refs: usize,
    local: broadcast::Sender<Delivery>,
    stop: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<Uuid, Channel>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<Uuid, Channel>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SubscriptionManager {
    feed: Arc<dyn ChangeFeed>,
    reconnect_delay: Duration,
    capacity: usize,
    channels: Registry,
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("reconnect_delay", &self.reconnect_delay)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, reconnect_delay: Duration) -> Self {
        Self {
            feed,
            reconnect_delay,
            capacity: DEFAULT_DELIVERY_CAPACITY,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Subscribe to a run's changes. The upstream subscription is live when
    /// this returns, so a snapshot read afterwards misses nothing.
    pub async fn acquire(&self, run_id: Uuid) -> Result<SubscriptionHandle> {
        if let Some(handle) = self.join_existing(run_id) {
            return Ok(handle);
        }

        let upstream = self.feed.subscribe(run_id).await?;

        let mut channels = lock(&self.channels);
        if let Some(channel) = channels.get_mut(&run_id) {
            // Lost a race with another acquire; ours is dropped.
            channel.refs += 1;
            return Ok(self.handle(run_id, channel.local.clone()));
        }

        let (local, _) = broadcast::channel(self.capacity);
        let stop = CancellationToken::new();
        tokio::spawn(pump(
            run_id,
            Arc::clone(&self.feed),
            upstream,
            local.clone(),
            stop.clone(),
            self.reconnect_delay,
        ));
        channels.insert(
            run_id,
            Channel {
                refs: 1,
                local: local.clone(),
                stop,
            },
        );
        debug!(%run_id, "subscribed to run changes");
        Ok(self.handle(run_id, local))
    }

    /// Same as dropping the handle.
    pub fn release(&self, handle: SubscriptionHandle) {
        drop(handle);
    }

    /// Runs with at least one live handle.
    pub fn active_count(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn ref_count(&self, run_id: Uuid) -> usize {
        lock(&self.channels).get(&run_id).map_or(0, |c| c.refs)
    }

    fn join_existing(&self, run_id: Uuid) -> Option<SubscriptionHandle> {
        let mut channels = lock(&self.channels);
        let channel = channels.get_mut(&run_id)?;
        channel.refs += 1;
        let local = channel.local.clone();
        drop(channels);
        Some(self.handle(run_id, local))
    }

    fn handle(&self, run_id: Uuid, local: broadcast::Sender<Delivery>) -> SubscriptionHandle {
        SubscriptionHandle {
            run_id,
            local,
            registry: Arc::clone(&self.channels),
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for (_, channel) in lock(&self.channels).drain() {
            channel.stop.cancel();
        }
    }
}

/// One reference to a run's subscription. Dropping it releases the
/// reference.
pub struct SubscriptionHandle {
    run_id: Uuid,
    local: broadcast::Sender<Delivery>,
    registry: Registry,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// A receiver for deliveries made from now on.
    pub fn deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.local.subscribe()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let mut channels = lock(&self.registry);
        let Some(channel) = channels.get_mut(&self.run_id) else {
            return;
        };
        channel.refs = channel.refs.saturating_sub(1);
        if channel.refs == 0 {
            if let Some(channel) = channels.remove(&self.run_id) {
                channel.stop.cancel();
            }
            debug!(run_id = %self.run_id, "unsubscribed from run changes");
        }
    }
}

async fn pump(
    run_id: Uuid,
    feed: Arc<dyn ChangeFeed>,
    mut upstream: broadcast::Receiver<ChangeNotification>,
    local: broadcast::Sender<Delivery>,
    stop: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            received = upstream.recv() => received,
        };
        match received {
            Ok(notification) => {
                let _ = local.send(Delivery::Notification(notification));
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(%run_id, skipped, "change feed lagged; requesting resync");
                let _ = local.send(Delivery::Resync);
            }
            Err(RecvError::Closed) => {
                warn!(%run_id, delay_ms = reconnect_delay.as_millis() as u64, "change feed closed; reconnecting");
                let Some(fresh) = reconnect(run_id, feed.as_ref(), &stop, reconnect_delay).await else {
                    return;
                };
                upstream = fresh;
                info!(%run_id, "change feed reconnected");
                let _ = local.send(Delivery::Resync);
            }
        }
    }
}

async fn reconnect(
    run_id: Uuid,
    feed: &dyn ChangeFeed,
    stop: &CancellationToken,
    delay: Duration,
) -> Option<broadcast::Receiver<ChangeNotification>> {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match feed.subscribe(run_id).await {
            Ok(receiver) => return Some(receiver),
            Err(err) => warn!(%run_id, error = %err, "re-subscribe failed; will retry"),
        }
    }
}
