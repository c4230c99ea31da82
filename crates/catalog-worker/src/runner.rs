//! Drives every non-terminal run forward, one `tick` per poll
//! (`spec.md` §4.2: "a worker loop calls `tick` once per poll so many
//! runs share the process").

use std::sync::Arc;

use catalog_engine::RunOrchestrator;
use catalog_storage::StateStore;
use tokio::sync::watch;

pub async fn run(
    store: Arc<dyn StateStore>,
    orchestrator: Arc<RunOrchestrator>,
    poll_interval: std::time::Duration,
    batch_size: u32,
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

        let run_ids = match store.list_active_run_ids(batch_size).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %err.message, "failed to list active runs; retrying next poll");
                continue;
            }
        };

        for run_id in run_ids {
            if let Err(err) = orchestrator.start_run(run_id).await {
                tracing::warn!(%run_id, error = %err.message, "failed to start run");
                continue;
            }
            if let Err(err) = orchestrator.tick(run_id).await {
                tracing::warn!(%run_id, error = %err.message, "tick failed");
            }
        }
    }

    tracing::info!("run driver loop stopped");
}
