use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use catalog_core::events::EventEnvelope;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::bus::{Bus, BusError, EventStream};
use crate::inline::InlineBus;
use crate::origin::Origin;

#[derive(Serialize, Deserialize)]
struct WireMessage {
    origin: Origin,
    envelope: EventEnvelope,
}

/// Mirrors `InlineBus` onto a Redis pub/sub channel so every orchestrator
/// and worker replica observes the same event stream (`spec.md` §4.7).
///
/// Every publish always lands on the local `InlineBus` first, so in-process
/// subscribers never depend on Redis being reachable. Mirroring onto Redis
/// is attempted on a best-effort basis; a connection failure flips the bus
/// into inline-only fallback mode and logs once rather than on every
/// publish.
pub struct RedisBus {
    inline: InlineBus,
    channel: String,
    origin: Origin,
    fallback: Arc<AtomicBool>,
    publish_conn: Arc<Mutex<Option<redis::aio::ConnectionManager>>>,
}

impl RedisBus {
    /// Connects to `redis_url` and starts mirroring `channel` in both
    /// directions. Never fails: an unreachable broker degrades to
    /// inline-only operation instead of returning an error, matching the
    /// "the engine never blocks on the broker" requirement.
    pub async fn connect(redis_url: &str, channel: impl Into<String>) -> Self {
        let bus = Self {
            inline: InlineBus::new(),
            channel: channel.into(),
            origin: Origin::current(),
            fallback: Arc::new(AtomicBool::new(false)),
            publish_conn: Arc::new(Mutex::new(None)),
        };
        bus.start(redis_url).await;
        bus
    }

    async fn start(&self, redis_url: &str) {
        let client = match redis::Client::open(redis_url) {
            Ok(client) => client,
            Err(err) => {
                self.enter_fallback(&err.to_string());
                return;
            }
        };

        match client.get_connection_manager().await {
            Ok(manager) => {
                *self.publish_conn.lock().await = Some(manager);
            }
            Err(err) => {
                self.enter_fallback(&err.to_string());
                return;
            }
        }

        self.spawn_subscriber(client);
    }

    fn spawn_subscriber(&self, client: redis::Client) {
        let channel = self.channel.clone();
        let origin = self.origin;
        let fallback = self.fallback.clone();
        let inline = self.inline.clone();

        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    if !fallback.swap(true, Ordering::SeqCst) {
                        tracing::warn!(
                            error = %err,
                            "event bus broker unreachable; falling back to inline-only mode"
                        );
                    }
                    return;
                }
            };

            if let Err(err) = pubsub.subscribe(&channel).await {
                if !fallback.swap(true, Ordering::SeqCst) {
                    tracing::warn!(error = %err, "event bus subscribe failed; falling back to inline-only mode");
                }
                return;
            }

            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping non-UTF8 event bus message");
                        continue;
                    }
                };
                let wire: WireMessage = match serde_json::from_str(&payload) {
                    Ok(wire) => wire,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping malformed event bus message");
                        continue;
                    }
                };
                if wire.origin == origin {
                    // Already delivered locally at publish time.
                    continue;
                }
                let _ = inline.publish_local(wire.envelope);
            }

            // The subscription stream ended (connection dropped). Mirroring
            // is no longer active; fall back so publishers stop waiting on
            // a dead connection.
            if !fallback.swap(true, Ordering::SeqCst) {
                tracing::warn!("event bus subscriber stream ended; falling back to inline-only mode");
            }
        });
    }

    fn enter_fallback(&self, reason: &str) {
        if !self.fallback.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                reason,
                "event bus broker unreachable; falling back to inline-only mode"
            );
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), BusError> {
        self.inline.publish_local(envelope.clone());

        if self.fallback.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut guard = self.publish_conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(());
        };

        let wire = WireMessage {
            origin: self.origin,
            envelope,
        };
        let payload = match serde_json::to_string(&wire) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode event for broker mirroring");
                return Ok(());
            }
        };

        if let Err(err) = conn.publish::<_, _, ()>(&self.channel, payload).await {
            drop(guard);
            self.enter_fallback(&err.to_string());
        }

        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        self.inline.subscribe()
    }
}
