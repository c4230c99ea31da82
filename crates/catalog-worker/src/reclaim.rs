//! Crash-recovery sweep (`spec.md` §4.2): resets step claims abandoned by
//! a worker process that died mid-heartbeat, independent of the per-run
//! heartbeat check `RunOrchestrator::tick` already does for runs it is
//! actively driving.

use std::sync::Arc;

use catalog_storage::StateStore;
use tokio::sync::watch;

pub async fn run(
    store: Arc<dyn StateStore>,
    poll_interval: std::time::Duration,
    stale_after_ms: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
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

        match store.reclaim_stale_steps(stale_after_ms).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                tracing::info!(count = reclaimed.len(), "reclaimed steps abandoned by a dead worker");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err.message, "stale-step reclaim sweep failed"),
        }
    }

    tracing::info!("reclaim sweep stopped");
}
