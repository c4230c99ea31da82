//! AppHub Catalog's background process (`SPEC_FULL.md` §2, §6): drives
//! every non-terminal run, dispatches cron schedules and event triggers,
//! sweeps abandoned step claims, and emits the periodic analytics
//! snapshot. Structurally this mirrors `everruns-api::main`'s single
//! `tracing_subscriber` init and one-time dependency assembly, but the
//! binary's job is background loops rather than an HTTP router.

mod analytics;
mod automaterialize;
mod config;
mod reclaim;
mod runner;
mod scheduler;
mod triggers;

use std::sync::Arc;

use anyhow::Context;
use catalog_engine::{EnvServiceResolver, JobHandlerRegistry, OrchestratorConfig, RunOrchestrator, StepExecutor};
use catalog_storage::{PostgresStateStore, StateStore};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::analytics::StoreAnalyticsSource;
use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "catalog=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("catalog-worker starting...");

    let config = Config::from_env()?;

    let store: Arc<dyn StateStore> = Arc::new(
        PostgresStateStore::connect(&config.database_url)
            .await
            .map_err(|err| anyhow::anyhow!(err.message))
            .context("failed to connect to Postgres and apply schema migrations")?,
    );
    tracing::info!("connected to Postgres and applied migrations");

    let bus = catalog_events::bus_from_env().await;

    let executor = Arc::new(StepExecutor::new(JobHandlerRegistry::new(), Arc::new(EnvServiceResolver)));
    let orchestrator = Arc::new(RunOrchestrator::new(store.clone(), bus.clone(), executor, OrchestratorConfig::default()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run_driver = tokio::spawn(runner::run(
        store.clone(),
        orchestrator.clone(),
        config.run_poll_interval,
        config.run_batch_size,
        shutdown_rx.clone(),
    ));
    let schedule_dispatcher = tokio::spawn(scheduler::run(
        store.clone(),
        orchestrator.clone(),
        config.schedule_poll_interval,
        config.schedule_batch_size,
        shutdown_rx.clone(),
    ));
    let reclaim_sweep = tokio::spawn(reclaim::run(
        store.clone(),
        config.reclaim_interval,
        config.stale_after_ms,
        shutdown_rx.clone(),
    ));
    let trigger_dispatcher = tokio::spawn(triggers::run(store.clone(), orchestrator.clone(), bus.clone()));
    let automaterialize_loop = tokio::spawn(automaterialize::run(
        store.clone(),
        orchestrator.clone(),
        config.automaterialize_poll_interval,
        shutdown_rx.clone(),
    ));
    let analytics_source = Arc::new(StoreAnalyticsSource::new(store.clone()));
    let analytics_task = catalog_events::spawn_analytics_task(
        bus,
        analytics_source,
        catalog_events::AnalyticsConfig::from_env(),
        shutdown_rx,
    );

    tracing::info!(
        "worker ready: run driver, scheduler, reclaim sweep, trigger dispatcher, auto-materialize loop, and analytics task running"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(run_driver, schedule_dispatcher, reclaim_sweep, automaterialize_loop, analytics_task);
    trigger_dispatcher.abort();

    Ok(())
}
