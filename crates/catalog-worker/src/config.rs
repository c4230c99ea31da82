//! Environment-driven configuration, mirroring `catalog-api::config`'s
//! associated-function style.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// How often the run-driving loop polls for active runs.
    pub run_poll_interval: Duration,
    /// How often the scheduler loop checks for due cron schedules.
    pub schedule_poll_interval: Duration,
    /// How often the crash-recovery sweep resets stale step claims.
    pub reclaim_interval: Duration,
    /// How often the auto-materialize evaluator re-scans every workflow
    /// definition's produced-asset declarations.
    pub automaterialize_poll_interval: Duration,
    /// A step claim with no heartbeat in this long is considered
    /// abandoned by a dead worker process.
    pub stale_after_ms: i64,
    /// Runs driven per poll tick, each a `tick()` call.
    pub run_batch_size: u32,
    /// Schedules claimed per poll tick.
    pub schedule_batch_size: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable required"))?;
        Ok(Self {
            database_url,
            run_poll_interval: Duration::from_millis(env_u64("APPHUB_WORKER_RUN_POLL_MS", 500)),
            schedule_poll_interval: Duration::from_millis(env_u64("APPHUB_WORKER_SCHEDULE_POLL_MS", 5_000)),
            reclaim_interval: Duration::from_millis(env_u64("APPHUB_WORKER_RECLAIM_POLL_MS", 30_000)),
            automaterialize_poll_interval: Duration::from_millis(env_u64("APPHUB_WORKER_AUTOMATERIALIZE_POLL_MS", 15_000)),
            stale_after_ms: env_u64("APPHUB_WORKER_STALE_AFTER_MS", 120_000) as i64,
            run_batch_size: env_u64("APPHUB_WORKER_RUN_BATCH_SIZE", 50) as u32,
            schedule_batch_size: env_u64("APPHUB_WORKER_SCHEDULE_BATCH_SIZE", 50) as u32,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok()).unwrap_or(default)
}
