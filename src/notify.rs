use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for schedule and booking changes, one channel per tour.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes of a tour. Creates the channel if needed.
    pub fn subscribe(&self, tour_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(tour_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, tour_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&tour_id) {
            if sender.send(event.clone()).is_err() {
                drop(sender);
                // Every receiver is gone.
                self.channels.remove_if(&tour_id, |_, s| s.receiver_count() == 0);
            }
        }
    }

    pub fn has_listeners(&self, tour_id: &Ulid) -> bool {
        self.channels
            .get(tour_id)
            .is_some_and(|s| s.receiver_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let tid = Ulid::new();
        let mut rx = hub.subscribe(tid);

        let event = Event::SlotCancelled {
            id: Ulid::new(),
            tour_id: tid,
        };
        hub.send(tid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let tid = Ulid::new();
        hub.send(
            tid,
            &Event::SlotDeleted {
                id: Ulid::new(),
                tour_id: tid,
            },
        );
        assert!(!hub.has_listeners(&tid));
    }

    #[tokio::test]
    async fn dropped_receivers_free_the_channel() {
        let hub = NotifyHub::new();
        let tid = Ulid::new();
        let rx = hub.subscribe(tid);
        assert!(hub.has_listeners(&tid));
        drop(rx);
        hub.send(
            tid,
            &Event::SlotCancelled {
                id: Ulid::new(),
                tour_id: tid,
            },
        );
        assert!(!hub.has_listeners(&tid));
    }
}
