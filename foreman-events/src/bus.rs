//! In-memory fan-out bus for live subscribers.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::EventRecord;

const BUS_CAPACITY: usize = 1024;

/// Broadcast bus carrying every stored event to live subscribers
/// (SSE streams, roundabout monitors).
///
/// A lagging subscriber loses bus events only; the durable log keeps
/// everything.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<EventRecord>>,
}

impl EventBus {
    /// Create a bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to all events from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EventRecord>> {
        self.sender.subscribe()
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: Arc<EventRecord>) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use chrono::Utc;
    use foreman_types::RunId;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(Arc::new(EventRecord {
            id: 1,
            run_id: RunId::new(7),
            seq: 1,
            event_type: EventType::WorkerHeartbeat,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        }));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.run_id, RunId::new(7));
        assert_eq!(event.event_type, EventType::WorkerHeartbeat);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Arc::new(EventRecord {
            id: 1,
            run_id: RunId::new(1),
            seq: 1,
            event_type: EventType::Error,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        }));
        assert_eq!(bus.receiver_count(), 0);
    }
}
