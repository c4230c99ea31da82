//! Cross-process event bus (`spec.md` §4.7).
//!
//! Transport is split from the wire shape on purpose: `catalog_core::events`
//! defines what an event looks like, this crate defines how it gets from one
//! publisher to every subscriber, in-process and (optionally) across
//! replicas via Redis pub/sub.

mod analytics;
mod bus;
mod inline;
mod origin;
mod redis_bus;

pub use analytics::{spawn_analytics_task, AnalyticsConfig, AnalyticsError, AnalyticsSource};
pub use bus::{Bus, BusError, EventStream};
pub use inline::InlineBus;
pub use origin::Origin;
pub use redis_bus::RedisBus;

use std::sync::Arc;

/// Builds the bus configured by environment (`spec.md` §6): `REDIS_URL` (or
/// the literal `inline`) combined with `APPHUB_EVENTS_MODE` selects the
/// transport. Falls back to `InlineBus` if neither is set or mode is
/// `inline`.
pub async fn bus_from_env() -> Arc<dyn Bus> {
    let mode = std::env::var("APPHUB_EVENTS_MODE").unwrap_or_default();
    let redis_url = std::env::var("REDIS_URL").ok();

    let wants_redis = mode.eq_ignore_ascii_case("redis")
        || redis_url.as_deref().is_some_and(|url| url != "inline");

    match (wants_redis, redis_url) {
        (true, Some(url)) if url != "inline" => {
            let channel = std::env::var("APPHUB_EVENTS_CHANNEL")
                .unwrap_or_else(|_| "apphub:events".to_string());
            Arc::new(RedisBus::connect(&url, channel).await)
        }
        _ => Arc::new(InlineBus::new()),
    }
}
