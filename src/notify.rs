//! Live Notifier
//!
//! Turns a raw change-bus receiver into a per-subscriber ordered feed: a
//! subscriber that has observed revision R never sees anything at or below
//! R again, even if the bus replays or interleaves notifications.

use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::bus::{ChangeBus, ChangeEvent};

pub struct LiveNotifier {
    bus: Arc<ChangeBus>,
}

impl LiveNotifier {
    pub fn new(bus: Arc<ChangeBus>) -> Self {
        Self { bus }
    }

    /// Open a subscription for one player. `last_seen` lets a reconnecting
    /// client skip revisions it already processed; new clients pass 0.
    pub fn subscribe(&self, player_id: &str, last_seen: u64) -> Subscription {
        Subscription {
            player_id: player_id.to_string(),
            rx: self.bus.subscribe(player_id),
            last_revision: last_seen,
        }
    }
}

/// One subscriber's view of a player's change feed. Closed when the bus
/// side goes away; dropping it is the disconnect.
pub struct Subscription {
    player_id: String,
    rx: tokio::sync::broadcast::Receiver<ChangeEvent>,
    last_revision: u64,
}

impl Subscription {
    /// Next event with a revision above everything delivered so far, or
    /// None when the feed is closed. Duplicates and out-of-order events
    /// are discarded, not surfaced.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.revision > self.last_revision => {
                    self.last_revision = ev.revision;
                    return Some(ev);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber for {} lagged, {} events skipped",
                        self.player_id, skipped
                    );
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Highest revision delivered to this subscriber.
    pub fn last_revision(&self) -> u64 {
        self.last_revision
    }

    pub fn into_stream(self) -> impl Stream<Item = ChangeEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next_event().await.map(|ev| (ev, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(revision: u64) -> ChangeEvent {
        ChangeEvent {
            player_id: "p1".to_string(),
            revision,
            summary: format!("rev {}", revision),
            origin: "r1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let bus = Arc::new(ChangeBus::new(16));
        let notifier = LiveNotifier::new(bus.clone());
        let mut sub = notifier.subscribe("p1", 0);

        for rev in 1..=3 {
            bus.publish(event(rev));
        }
        assert_eq!(sub.next_event().await.unwrap().revision, 1);
        assert_eq!(sub.next_event().await.unwrap().revision, 2);
        assert_eq!(sub.next_event().await.unwrap().revision, 3);
        assert_eq!(sub.last_revision(), 3);
    }

    #[tokio::test]
    async fn test_duplicates_and_stale_revisions_are_discarded() {
        let bus = Arc::new(ChangeBus::new(16));
        let notifier = LiveNotifier::new(bus.clone());
        let mut sub = notifier.subscribe("p1", 0);

        bus.publish(event(1));
        bus.publish(event(1));
        bus.publish(event(2));
        bus.publish(event(1));
        bus.publish(event(3));

        assert_eq!(sub.next_event().await.unwrap().revision, 1);
        assert_eq!(sub.next_event().await.unwrap().revision, 2);
        assert_eq!(sub.next_event().await.unwrap().revision, 3);
    }

    #[tokio::test]
    async fn test_last_seen_skips_already_processed() {
        let bus = Arc::new(ChangeBus::new(16));
        let notifier = LiveNotifier::new(bus.clone());
        let mut sub = notifier.subscribe("p1", 5);

        bus.publish(event(4));
        bus.publish(event(5));
        bus.publish(event(6));

        assert_eq!(sub.next_event().await.unwrap().revision, 6);
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        let bus = Arc::new(ChangeBus::new(16));
        let notifier = LiveNotifier::new(bus.clone());
        let sub = notifier.subscribe("p1", 0);

        bus.publish(event(1));
        bus.publish(event(2));

        let revisions: Vec<u64> = sub
            .into_stream()
            .take(2)
            .map(|ev| ev.revision)
            .collect()
            .await;
        assert_eq!(revisions, vec![1, 2]);
    }
}
