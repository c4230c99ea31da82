use std::pin::Pin;

use async_trait::async_trait;
use catalog_core::events::EventEnvelope;
use futures::Stream;

/// A live subscription: an unbounded stream of envelopes, already filtered
/// of any loopback from this process's own publishes.
pub type EventStream = Pin<Box<dyn Stream<Item = EventEnvelope> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// Publish/subscribe fan-out for engine lifecycle events. Implementations
/// never block a caller on broker availability: `publish` always succeeds
/// against the in-process fan-out even if cross-process mirroring is
/// degraded (`spec.md` §4.7).
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), BusError>;

    fn subscribe(&self) -> EventStream;
}
