/// Live run event fan-out
///
/// One broadcast channel per run. The execution unit publishes `metadata` when an
/// attempt starts, every pipeline event, and a final `end` carrying the status;
/// `end` also drops the channel. Slow subscribers lose events rather than
/// slowing the pipeline down.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event: String,
    pub data: Value,
}

#[derive(Debug)]
pub struct RunEventHub {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<RunEvent>>>,
    capacity: usize,
}

impl Default for RunEventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RunEventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<Uuid, broadcast::Sender<RunEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to a run, opening its channel if nobody has yet
    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<RunEvent> {
        self.channels()
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to current subscribers; events for runs nobody watches are dropped
    pub fn publish(&self, run_id: Uuid, event: &str, data: Value) {
        if let Some(sender) = self.channels().get(&run_id) {
            let _ = sender.send(RunEvent {
                event: event.to_string(),
                data,
            });
        }
    }

    /// Publish the final `end` event and drop the channel
    pub fn finish(&self, run_id: Uuid, status: &str) {
        if let Some(sender) = self.channels().remove(&run_id) {
            let _ = sender.send(RunEvent {
                event: "end".to_string(),
                data: serde_json::json!({ "status": status }),
            });
        }
    }

    /// Drop a channel nobody listens to any more
    pub fn release_idle(&self, run_id: Uuid) {
        let mut channels = self.channels();
        if channels
            .get(&run_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&run_id);
        }
    }

    pub fn live_runs(&self) -> usize {
        self.channels().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_see_events_until_end() {
        let hub = RunEventHub::default();
        let run_id = Uuid::new_v4();
        let mut rx = hub.subscribe(run_id);

        hub.publish(run_id, "checkpoint", json!({"values": {}}));
        hub.finish(run_id, "success");

        assert_eq!(rx.recv().await.expect("checkpoint").event, "checkpoint");
        let end = rx.recv().await.expect("end");
        assert_eq!(end.event, "end");
        assert_eq!(end.data, json!({"status": "success"}));
        assert!(rx.recv().await.is_err());
        assert_eq!(hub.live_runs(), 0);
    }

    #[test]
    fn idle_channels_are_released() {
        let hub = RunEventHub::default();
        let run_id = Uuid::new_v4();
        let first = hub.subscribe(run_id);
        let second = hub.subscribe(run_id);

        drop(first);
        hub.release_idle(run_id);
        assert_eq!(hub.live_runs(), 1);

        drop(second);
        hub.release_idle(run_id);
        assert_eq!(hub.live_runs(), 0);
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let hub = RunEventHub::default();
        hub.publish(Uuid::new_v4(), "progress", json!(1));
        assert_eq!(hub.live_runs(), 0);
    }
}
