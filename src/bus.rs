//! Change Bus
//!
//! Publish/subscribe fan-out of state-change notifications, keyed by
//! player id. One instance is shared by every replica of a deployment:
//! replicas listen on the firehose to invalidate their caches, live
//! subscribers listen per player.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A state-change notification. `revision` is the per-player monotonic
/// counter; `origin` identifies the publishing replica so replicas can
/// skip their own events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub player_id: String,
    pub revision: u64,
    pub summary: String,
    pub origin: String,
}

pub struct ChangeBus {
    channels: DashMap<String, broadcast::Sender<ChangeEvent>>,
    firehose: broadcast::Sender<ChangeEvent>,
    capacity: usize,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            firehose,
            capacity,
        }
    }

    /// Publish to the player's channel and the firehose. Events with no
    /// listeners are dropped silently.
    pub fn publish(&self, event: ChangeEvent) {
        if let Some(tx) = self.channels.get(&event.player_id) {
            let _ = tx.send(event.clone());
        }
        let _ = self.firehose.send(event);
    }

    /// Subscribe to one player's change events.
    pub fn subscribe(&self, player_id: &str) -> broadcast::Receiver<ChangeEvent> {
        self.channels
            .entry(player_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to every player's change events (replica cache
    /// invalidation).
    pub fn subscribe_all(&self) -> broadcast::Receiver<ChangeEvent> {
        self.firehose.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(player_id: &str, revision: u64) -> ChangeEvent {
        ChangeEvent {
            player_id: player_id.to_string(),
            revision,
            summary: "test".to_string(),
            origin: "r1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_per_player_channels_are_isolated() {
        let bus = ChangeBus::new(16);
        let mut rx1 = bus.subscribe("p1");
        let mut rx2 = bus.subscribe("p2");

        bus.publish(event("p1", 1));
        bus.publish(event("p2", 1));

        assert_eq!(rx1.recv().await.unwrap().player_id, "p1");
        assert_eq!(rx2.recv().await.unwrap().player_id, "p2");
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_firehose_sees_everything() {
        let bus = ChangeBus::new(16);
        let mut all = bus.subscribe_all();

        bus.publish(event("p1", 1));
        bus.publish(event("p2", 1));

        assert_eq!(all.recv().await.unwrap().player_id, "p1");
        assert_eq!(all.recv().await.unwrap().player_id, "p2");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = ChangeBus::new(16);
        bus.publish(event("ghost", 1));
    }
}
