use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog_core::events::{EventEnvelope, EventType};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::Bus;

const DEFAULT_INTERVAL_MS: u64 = 30_000;

/// Configuration for the periodic `workflow.analytics.snapshot` task
/// (`spec.md` §4.7, §6).
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub interval: Duration,
    pub disabled: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            disabled: false,
        }
    }
}

impl AnalyticsConfig {
    /// Reads `APPHUB_ANALYTICS_INTERVAL_MS` (default 30000; `<= 0` disables)
    /// and `APPHUB_DISABLE_ANALYTICS`.
    pub fn from_env() -> Self {
        let interval_ms = std::env::var("APPHUB_ANALYTICS_INTERVAL_MS")
            .ok()
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(DEFAULT_INTERVAL_MS as i64);

        let explicit_disable = std::env::var("APPHUB_DISABLE_ANALYTICS")
            .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            interval: Duration::from_millis(interval_ms.max(0) as u64),
            disabled: explicit_disable || interval_ms <= 0,
        }
    }
}

/// Errors a snapshot computation can raise. `Fatal` self-suspends the task
/// entirely (`spec.md` §4.7: "self-suspends on fatal DB errors"); `Transient`
/// is logged and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("transient analytics error: {0}")]
    Transient(String),
    #[error("fatal analytics error: {0}")]
    Fatal(String),
}

/// Computes the payload for one analytics snapshot tick. Implemented
/// against whichever state store backend is active; kept as a narrow trait
/// here so the event bus crate does not need a `sqlx` dependency of its
/// own.
#[async_trait]
pub trait AnalyticsSource: Send + Sync + 'static {
    async fn snapshot(&self, now: chrono::DateTime<Utc>) -> Result<serde_json::Value, AnalyticsError>;
}

/// Spawns the analytics loop. Returns immediately; the returned handle
/// completes once `shutdown` is signalled or the source reports a fatal
/// error. The loop awaits each snapshot sequentially before scheduling the
/// next tick, so it is single-flight by construction: a slow computation
/// simply pushes the next tick out (`MissedTickBehavior::Delay`) rather
/// than running concurrently with itself.
pub fn spawn_analytics_task(
    bus: Arc<dyn Bus>,
    source: Arc<dyn AnalyticsSource>,
    config: AnalyticsConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if config.disabled {
            tracing::info!("analytics snapshot task disabled");
            return;
        }

        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = Utc::now();
            match source.snapshot(now).await {
                Ok(payload) => {
                    let envelope = EventEnvelope::new(
                        EventType::WorkflowAnalyticsSnapshot,
                        "catalog-events",
                        payload,
                    );
                    let _ = bus.publish(envelope).await;
                }
                Err(AnalyticsError::Transient(reason)) => {
                    tracing::warn!(reason, "analytics snapshot failed; will retry next tick");
                }
                Err(AnalyticsError::Fatal(reason)) => {
                    tracing::error!(reason, "analytics snapshot hit a fatal error; suspending task");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InlineBus;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl AnalyticsSource for CountingSource {
        async fn snapshot(&self, _now: chrono::DateTime<Utc>) -> Result<serde_json::Value, AnalyticsError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after == Some(n) {
                return Err(AnalyticsError::Fatal("connection refused".into()));
            }
            Ok(serde_json::json!({"tick": n}))
        }
    }

    #[tokio::test]
    async fn emits_snapshot_events_on_each_tick() {
        let bus: Arc<dyn Bus> = Arc::new(InlineBus::new());
        let mut sub = bus.subscribe();
        let source = Arc::new(CountingSource {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_after: None,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = AnalyticsConfig {
            interval: Duration::from_millis(5),
            disabled: false,
        };

        let handle = spawn_analytics_task(bus, source, config, shutdown_rx);

        let event = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("timed out waiting for snapshot event")
            .expect("stream closed");
        assert_eq!(event.event_type, EventType::WorkflowAnalyticsSnapshot.as_str());

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn disabled_config_never_runs() {
        let bus: Arc<dyn Bus> = Arc::new(InlineBus::new());
        let source = Arc::new(CountingSource {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_after: None,
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = AnalyticsConfig {
            interval: Duration::from_millis(5),
            disabled: true,
        };

        let handle = spawn_analytics_task(bus, source.clone(), config, shutdown_rx);
        handle.await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_error_self_suspends() {
        let bus: Arc<dyn Bus> = Arc::new(InlineBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(CountingSource {
            calls: calls.clone(),
            fail_after: Some(1),
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = AnalyticsConfig {
            interval: Duration::from_millis(5),
            disabled: false,
        };

        let handle = spawn_analytics_task(bus, source, config, shutdown_rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should self-suspend instead of hanging")
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
