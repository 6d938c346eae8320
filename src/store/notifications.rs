// src/store/notifications.rs

//! Change-notification payloads and the per-run topic registry.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::state::{RunRow, StepStateRow, StepTaskRow};

/// One row change; the payload is always the full new row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "row", rename_all = "snake_case")]
pub enum ChangeNotification {
    RunUpdated(RunRow),
    StepStateInserted(StepStateRow),
    StepStateUpdated(StepStateRow),
    StepTaskInserted(StepTaskRow),
    StepTaskUpdated(StepTaskRow),
}

impl ChangeNotification {
    pub fn run_id(&self) -> Uuid {
        match self {
            ChangeNotification::RunUpdated(r) => r.run_id,
            ChangeNotification::StepStateInserted(s) | ChangeNotification::StepStateUpdated(s) => {
                s.run_id
            }
            ChangeNotification::StepTaskInserted(t) | ChangeNotification::StepTaskUpdated(t) => {
                t.run_id
            }
        }
    }
}

/// Broadcast topics keyed by run id.
///
/// Topics are created on first subscribe and dropped once a publish finds no
/// receivers left, or when [`NotificationHub::close`] is called.
pub struct NotificationHub {
    topics: Mutex<HashMap<Uuid, broadcast::Sender<ChangeNotification>>>,
    capacity: usize,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<Uuid, broadcast::Sender<ChangeNotification>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<ChangeNotification> {
        let mut topics = self.topics();
        topics
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn publish(&self, notification: ChangeNotification) {
        let run_id = notification.run_id();
        let mut topics = self.topics();
        let Some(sender) = topics.get(&run_id) else {
            return;
        };
        if sender.send(notification).is_err() {
            trace!(%run_id, "no subscribers left; dropping topic");
            topics.remove(&run_id);
        }
    }

    /// Drop the topic; current receivers observe a closed channel.
    pub fn close(&self, run_id: Uuid) -> bool {
        self.topics().remove(&run_id).is_some()
    }

    /// Live receivers for a run (0 when no topic exists).
    pub fn subscriber_count(&self, run_id: Uuid) -> usize {
        self.topics()
            .get(&run_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunStatus;
    use serde_json::json;

    fn run_row(run_id: Uuid) -> RunRow {
        RunRow {
            run_id,
            flow_slug: "f".into(),
            status: RunStatus::Started,
            input: json!({}),
            output: None,
            error_message: None,
            remaining_steps: 1,
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    #[tokio::test]
    async fn publishes_only_to_the_runs_topic() {
        let hub = NotificationHub::new(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(a);
        let mut rx_b = hub.subscribe(b);

        hub.publish(ChangeNotification::RunUpdated(run_row(a)));

        assert_eq!(rx_a.recv().await.unwrap().run_id(), a);
        assert!(matches!(
            rx_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn topic_is_dropped_when_last_receiver_goes_away() {
        let hub = NotificationHub::new(8);
        let run_id = Uuid::new_v4();
        let rx = hub.subscribe(run_id);
        assert_eq!(hub.subscriber_count(run_id), 1);

        drop(rx);
        hub.publish(ChangeNotification::RunUpdated(run_row(run_id)));
        assert_eq!(hub.subscriber_count(run_id), 0);
        assert!(!hub.close(run_id));
    }

    #[test]
    fn payload_is_tagged() {
        let value =
            serde_json::to_value(ChangeNotification::RunUpdated(run_row(Uuid::nil()))).unwrap();
        assert_eq!(value["kind"], "run_updated");
        assert_eq!(value["row"]["status"], "started");
    }
}
