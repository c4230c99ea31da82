use async_trait::async_trait;
use catalog_core::events::EventEnvelope;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::bus::{Bus, BusError, EventStream};

const CHANNEL_CAPACITY: usize = 1024;

/// Process-local publish/subscribe fan-out. Backed by a `tokio::broadcast`
/// channel; a subscriber that falls behind by more than `CHANNEL_CAPACITY`
/// messages silently drops the oldest ones rather than blocking publishers
/// (`spec.md` §5: the event bus is best-effort, not a guaranteed-delivery
/// queue).
#[derive(Clone)]
pub struct InlineBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl InlineBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for InlineBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineBus {
    /// Synchronous send used internally by `RedisBus`, which needs to
    /// deliver locally before (or regardless of) attempting the network
    /// hop. No subscribers is not an error: events are fire-and-forget.
    pub(crate) fn publish_local(&self, envelope: EventEnvelope) {
        let _ = self.tx.send(envelope);
    }
}

#[async_trait]
impl Bus for InlineBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), BusError> {
        self.publish_local(envelope);
        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        let rx = self.tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| async move { item.ok() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_published_events_to_subscribers() {
        let bus = InlineBus::new();
        let mut sub = bus.subscribe();

        let envelope = EventEnvelope::new(
            catalog_core::events::EventType::WorkflowRunSucceeded,
            "test",
            json!({"runId": "abc"}),
        );
        bus.publish(envelope.clone()).await.unwrap();

        let received = sub.next().await.expect("stream closed unexpectedly");
        assert_eq!(received.id, envelope.id);
        assert_eq!(received.event_type, envelope.event_type);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = InlineBus::new();
        let envelope = EventEnvelope::new(
            catalog_core::events::EventType::AssetProduced,
            "test",
            json!({}),
        );
        bus.publish(envelope).await.unwrap();
    }
}
