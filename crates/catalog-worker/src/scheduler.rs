//! Cron schedule dispatch loop (`spec.md` §4.5): claims due schedules,
//! materializes every missed window (or just the latest, per
//! `catchUp`), and creates a run per window.

use std::sync::Arc;

use catalog_core::{MaterializedWindow, Schedule, TriggerSnapshot, TriggeredBy};
use catalog_engine::{CreateRunRequest, RunOrchestrator};
use catalog_storage::StateStore;
use chrono::Utc;
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

        let claimed = match store.claim_due_schedules(batch_size).await {
            Ok(claimed) => claimed,
            Err(err) => {
                tracing::warn!(error = %err.message, "failed to claim due schedules; retrying next poll");
                continue;
            }
        };

        for claimed in claimed {
            if let Err(err) = dispatch_schedule(&store, &orchestrator, claimed.schedule).await {
                tracing::warn!(error = %err.message, "schedule dispatch failed");
            }
        }
    }

    tracing::info!("scheduler loop stopped");
}

async fn dispatch_schedule(
    store: &Arc<dyn StateStore>,
    orchestrator: &Arc<RunOrchestrator>,
    mut schedule: Schedule,
) -> Result<(), catalog_core::EngineError> {
    let now = Utc::now();
    let definition = store.get_definition(schedule.workflow_definition_id).await?;

    let windows = if schedule.catch_up {
        let cursor = schedule.catchup_cursor.unwrap_or(now - chrono::Duration::hours(24));
        catalog_engine::catchup_windows(&schedule.cron, cursor, now)?
    } else {
        catalog_engine::latest_window(&schedule.cron, now)?.into_iter().collect()
    };

    let start_window = schedule.start_window;
    let end_window = schedule.end_window;
    let in_window = move |at: chrono::DateTime<Utc>| {
        start_window.map(|start| at >= start).unwrap_or(true) && end_window.map(|end| at <= end).unwrap_or(true)
    };

    for window_start in windows.iter().copied().filter(|w| in_window(*w)) {
        let trigger = TriggerSnapshot {
            triggered_by: TriggeredBy::Schedule,
            schedule_id: Some(schedule.id),
            event_trigger_id: None,
            source_event_id: None,
            asset_id: None,
        };
        orchestrator
            .create_run(CreateRunRequest {
                workflow_definition_id: definition.id,
                parameters: definition.default_parameters.clone(),
                run_key: None,
                triggered_by: TriggeredBy::Schedule,
                trigger: Some(trigger),
                partition_key: Some(window_start.to_rfc3339()),
            })
            .await?;
        schedule.last_materialized_window = Some(MaterializedWindow { window_start });
        schedule.catchup_cursor = Some(window_start);
    }

    schedule.next_run_at = catalog_engine::next_run_at(&schedule.cron, now)?;
    store.upsert_schedule(schedule).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_engine::{EnvServiceResolver, JobHandlerRegistry, OrchestratorConfig, StepExecutor};
    use catalog_events::InlineBus;
    use catalog_storage::{InMemoryStateStore, NewDefinition};

    fn test_orchestrator(store: Arc<dyn StateStore>) -> Arc<RunOrchestrator> {
        let bus = Arc::new(InlineBus::new());
        let executor = Arc::new(StepExecutor::new(JobHandlerRegistry::new(), Arc::new(EnvServiceResolver)));
        Arc::new(RunOrchestrator::new(store, bus, executor, OrchestratorConfig::default()))
    }

    #[tokio::test]
    async fn due_schedule_materializes_a_run_and_advances_cursor() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let definition = store
            .create_definition(NewDefinition {
                slug: "nightly".to_string(),
                name: "Nightly".to_string(),
                description: None,
                steps: vec![],
                triggers: vec![],
                parameters_schema: None,
                default_parameters: serde_json::json!({"mode": "full"}),
                output_schema: None,
                dag: Default::default(),
            })
            .await
            .unwrap();

        let now = Utc::now();
        let schedule = Schedule {
            id: uuid::Uuid::now_v7(),
            workflow_definition_id: definition.id,
            cron: "0 * * * * *".to_string(),
            timezone: None,
            start_window: None,
            end_window: None,
            catch_up: false,
            next_run_at: Some(now),
            last_materialized_window: None,
            catchup_cursor: None,
        };

        let orchestrator = test_orchestrator(store.clone());
        dispatch_schedule(&store, &orchestrator, schedule.clone()).await.unwrap();

        let active = store.list_active_run_ids(10).await.unwrap();
        assert_eq!(active.len(), 1);

        let persisted = store.upsert_schedule(schedule).await.unwrap();
        assert!(persisted.next_run_at.unwrap() > now);
    }

    #[tokio::test]
    async fn catch_up_runs_carry_distinct_window_partition_keys() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let definition = store
            .create_definition(NewDefinition {
                slug: "catchup".to_string(),
                name: "Catchup".to_string(),
                description: None,
                steps: vec![],
                triggers: vec![],
                parameters_schema: None,
                default_parameters: serde_json::json!({}),
                output_schema: None,
                dag: Default::default(),
            })
            .await
            .unwrap();

        let now = DateTime::parse_from_rfc3339("2025-01-01T01:00:00Z").unwrap().with_timezone(&Utc);
        let schedule = Schedule {
            id: uuid::Uuid::now_v7(),
            workflow_definition_id: definition.id,
            cron: "*/15 * * * *".to_string(),
            timezone: None,
            start_window: None,
            end_window: None,
            catch_up: true,
            next_run_at: Some(now),
            last_materialized_window: None,
            catchup_cursor: Some(now - chrono::Duration::hours(1)),
        };

        let orchestrator = test_orchestrator(store.clone());
        dispatch_schedule(&store, &orchestrator, schedule).await.unwrap();

        let active = store.list_active_run_ids(10).await.unwrap();
        assert_eq!(active.len(), 4);
        let mut keys: Vec<String> = Vec::new();
        for run_id in active {
            let run = store.get_run(run_id).await.unwrap();
            keys.push(run.partition_key.expect("catch-up run must carry a partitionKey"));
        }
        keys.sort();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| DateTime::parse_from_rfc3339(k).is_ok()));
        assert!(keys.contains(&now.to_rfc3339()));
        assert!(keys.contains(&(now - chrono::Duration::minutes(45)).to_rfc3339()));
    }
}
