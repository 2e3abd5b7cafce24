//! Broadcast event bus for distributing `EngineEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. The engine publishes only after a unit
//! of work has been persisted. Publishing with no active subscribers is a
//! no-op.

use tokenflow_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for process-instance lifecycle events.
///
/// Cloning the bus clones the sender, so producers and consumers can share it.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a subscriber that receives all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish a batch in order.
    pub fn publish_all(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn sender(&self) -> &broadcast::Sender<EngineEvent> {
        &self.sender
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn completed() -> EngineEvent {
        EngineEvent::ProcessCompleted {
            process_instance_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(completed());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, EngineEvent::ProcessCompleted { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(completed());

        assert!(matches!(rx1.recv().await.unwrap(), EngineEvent::ProcessCompleted { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), EngineEvent::ProcessCompleted { .. }));
    }

    #[tokio::test]
    async fn publish_all_preserves_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        bus.publish_all(vec![
            EngineEvent::ProcessStarted {
                process_instance_id: id,
                process_definition_key: "p".to_string(),
                business_key: None,
            },
            EngineEvent::ProcessCompleted {
                process_instance_id: id,
            },
        ]);

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::ProcessStarted { .. }));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::ProcessCompleted { .. }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(completed());
    }

    #[test]
    fn lagged_receiver_handles_gracefully() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for _ in 0..10 {
            bus.publish(completed());
        }

        match rx.try_recv() {
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(completed());

        assert!(rx.try_recv().is_ok());
    }
}
