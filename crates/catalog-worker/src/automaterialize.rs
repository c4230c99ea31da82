//! Auto-materialize evaluator (`spec.md` §4.5, §9): polls every workflow
//! definition's produced-asset declarations, decides whether each is due
//! for materialization, and starts a `triggeredBy=auto` run per due
//! partition. Structurally this mirrors `scheduler::run`'s claim-then-
//! dispatch poll loop, but the "claim" here is the per-partition
//! `AutoRunClaim` row rather than a `FOR UPDATE SKIP LOCKED` schedule row,
//! since there is no cron-like due set to pull from the database.

use std::sync::Arc;

use catalog_core::{AssetId, AutoRunClaim, Granularity, Partitioning, TriggerSnapshot, TriggeredBy};
use catalog_engine::{enumerate_lookback_keys, next_cooldown_backoff, should_auto_materialize, CreateRunRequest, RunOrchestrator};
use catalog_storage::StateStore;
use chrono::Utc;
use tokio::sync::watch;

pub async fn run(
    store: Arc<dyn StateStore>,
    orchestrator: Arc<RunOrchestrator>,
    poll_interval: std::time::Duration,
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

        let definitions = match store.list_latest_definitions().await {
            Ok(definitions) => definitions,
            Err(err) => {
                tracing::warn!(error = %err.message, "failed to list workflow definitions for auto-materialize poll");
                continue;
            }
        };

        for definition in definitions {
            if let Err(err) = evaluate_definition(&store, &orchestrator, &definition).await {
                tracing::warn!(
                    workflow_definition_id = %definition.id,
                    error = %err.message,
                    "auto-materialize evaluation failed for workflow definition"
                );
            }
        }
    }

    tracing::info!("auto-materialize loop stopped");
}

async fn evaluate_definition(
    store: &Arc<dyn StateStore>,
    orchestrator: &Arc<RunOrchestrator>,
    definition: &catalog_core::WorkflowDefinition,
) -> Result<(), catalog_core::EngineError> {
    let now = Utc::now();

    for step in &definition.steps {
        for declaration in &step.asset_declarations {
            if declaration.direction != catalog_core::AssetDirection::Produces {
                continue;
            }
            let Some(policy) = &declaration.auto_materialize else {
                continue;
            };
            if !policy.enabled {
                continue;
            }

            for partition_key in candidate_partition_keys(declaration.partitioning.as_ref(), now) {
                evaluate_partition(
                    store,
                    orchestrator,
                    definition,
                    &declaration.asset_id,
                    partition_key,
                    policy,
                    declaration.freshness.as_ref(),
                    now,
                )
                .await?;
            }
        }
    }

    Ok(())
}

/// Enumerates the partition keys an auto-materialize sweep should check for
/// one declaration. `Dynamic` partitioning has no enumerable key set (keys
/// come from whatever the producing step chooses to write), so it is
/// excluded from the sweep; it can still be materialized manually or by an
/// upstream event trigger.
fn candidate_partition_keys(partitioning: Option<&Partitioning>, now: chrono::DateTime<Utc>) -> Vec<Option<String>> {
    match partitioning {
        None => vec![None],
        Some(Partitioning::Static { keys }) => keys.iter().cloned().map(Some).collect(),
        Some(Partitioning::TimeWindow {
            granularity,
            format,
            lookback_windows,
            ..
        }) => {
            let windows = lookback_windows.unwrap_or(granularity.default_lookback_windows());
            enumerate_lookback_keys(now, *granularity, format.as_deref(), windows)
                .into_iter()
                .map(Some)
                .collect()
        }
        Some(Partitioning::Dynamic { .. }) => vec![],
    }
}

#[allow(clippy::too_many_arguments)]
async fn evaluate_partition(
    store: &Arc<dyn StateStore>,
    orchestrator: &Arc<RunOrchestrator>,
    definition: &catalog_core::WorkflowDefinition,
    asset_id: &AssetId,
    partition_key: Option<String>,
    policy: &catalog_core::AutoMaterializePolicy,
    freshness: Option<&catalog_core::FreshnessPolicy>,
    now: chrono::DateTime<Utc>,
) -> Result<(), catalog_core::EngineError> {
    let claim = store
        .get_auto_run_claim(definition.id, asset_id, partition_key.as_deref())
        .await?;

    if let Some(claim) = &claim {
        if let Some(next_eligible_at) = claim.next_eligible_at {
            if now < next_eligible_at {
                return Ok(());
            }
        }
        if let Some(run_id) = claim.workflow_run_id {
            let claimed_run = store.get_run(run_id).await?;
            if !claimed_run.is_terminal() {
                // a prior auto run for this partition is still in flight
                return Ok(());
            }
        }
    }

    let materialization = store.get_latest_materialization(definition.id, asset_id, partition_key.as_deref()).await?;
    if !should_auto_materialize(policy, materialization.as_ref(), freshness, now) {
        return Ok(());
    }

    let consecutive_failures = claim.as_ref().map(|c| c.consecutive_failures).unwrap_or(0);
    let trigger = TriggerSnapshot {
        triggered_by: TriggeredBy::Auto,
        schedule_id: None,
        event_trigger_id: None,
        source_event_id: None,
        asset_id: Some(asset_id.clone()),
    };

    let outcome = orchestrator
        .create_run(CreateRunRequest {
            workflow_definition_id: definition.id,
            parameters: definition.default_parameters.clone(),
            run_key: None,
            triggered_by: TriggeredBy::Auto,
            trigger: Some(trigger),
            partition_key: partition_key.clone(),
        })
        .await;

    let (workflow_run_id, consecutive_failures, next_eligible_at) = match &outcome {
        Ok(run) => (Some(run.id), 0, None),
        Err(err) => {
            tracing::warn!(
                workflow_definition_id = %definition.id,
                asset_id = %asset_id,
                partition_key = ?partition_key,
                error = %err.message,
                "auto-materialize run creation failed; backing off"
            );
            let consecutive_failures = consecutive_failures + 1;
            (None, consecutive_failures, Some(now + next_cooldown_backoff(consecutive_failures)))
        }
    };

    store
        .upsert_auto_run_claim(AutoRunClaim {
            id: claim.as_ref().map(|c| c.id).unwrap_or_else(uuid::Uuid::now_v7),
            workflow_definition_id: definition.id,
            asset_id: asset_id.clone(),
            partition_key,
            workflow_run_id,
            consecutive_failures,
            next_eligible_at,
            created_at: claim.as_ref().map(|c| c.created_at).unwrap_or(now),
            updated_at: now,
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{AssetDeclaration, AutoMaterializePolicy, FreshnessPolicy, StepKind};
    use catalog_engine::{EnvServiceResolver, JobHandlerRegistry, OrchestratorConfig, StepExecutor};
    use catalog_events::InlineBus;
    use catalog_storage::{InMemoryStateStore, NewDefinition};

    fn test_orchestrator(store: Arc<dyn StateStore>) -> Arc<RunOrchestrator> {
        let bus = Arc::new(InlineBus::new());
        let executor = Arc::new(StepExecutor::new(JobHandlerRegistry::new(), Arc::new(EnvServiceResolver)));
        Arc::new(RunOrchestrator::new(store, bus, executor, OrchestratorConfig::default()))
    }

    fn job_step(step_id: &str, asset_id: &str, policy: AutoMaterializePolicy) -> catalog_core::Step {
        catalog_core::Step {
            id: step_id.to_string(),
            name: step_id.to_string(),
            description: None,
            depends_on: vec![],
            retry_policy: None,
            asset_declarations: vec![AssetDeclaration {
                step_id: step_id.to_string(),
                direction: catalog_core::AssetDirection::Produces,
                asset_id: AssetId::parse(asset_id).unwrap(),
                asset_schema: None,
                freshness: Some(FreshnessPolicy {
                    max_age_ms: Some(1),
                    cron_rule: None,
                }),
                auto_materialize: Some(policy),
                partitioning: None,
            }],
            kind: StepKind::Job(catalog_core::JobStep {
                job_slug: "noop".to_string(),
                bundle: None,
                timeout_ms: None,
            }),
        }
    }

    #[tokio::test]
    async fn stale_unpartitioned_asset_gets_an_auto_run() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let definition = store
            .create_definition(NewDefinition {
                slug: "reports".to_string(),
                name: "Reports".to_string(),
                description: None,
                steps: vec![job_step(
                    "build",
                    "reports.daily",
                    AutoMaterializePolicy {
                        enabled: true,
                        cooldown_ms: None,
                    },
                )],
                triggers: vec![],
                parameters_schema: None,
                default_parameters: serde_json::json!({}),
                output_schema: None,
                dag: Default::default(),
            })
            .await
            .unwrap();

        let orchestrator = test_orchestrator(store.clone());
        evaluate_definition(&store, &orchestrator, &definition).await.unwrap();

        let active = store.list_active_run_ids(10).await.unwrap();
        assert_eq!(active.len(), 1);
        let run = store.get_run(active[0]).await.unwrap();
        assert_eq!(run.triggered_by, TriggeredBy::Auto);

        let claim = store
            .get_auto_run_claim(definition.id, &AssetId::parse("reports.daily").unwrap(), None)
            .await
            .unwrap()
            .expect("claim row recorded");
        assert_eq!(claim.workflow_run_id, Some(run.id));
        assert_eq!(claim.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn in_flight_auto_run_blocks_a_second_evaluation() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let definition = store
            .create_definition(NewDefinition {
                slug: "reports2".to_string(),
                name: "Reports2".to_string(),
                description: None,
                steps: vec![job_step(
                    "build",
                    "reports.weekly",
                    AutoMaterializePolicy {
                        enabled: true,
                        cooldown_ms: None,
                    },
                )],
                triggers: vec![],
                parameters_schema: None,
                default_parameters: serde_json::json!({}),
                output_schema: None,
                dag: Default::default(),
            })
            .await
            .unwrap();

        let orchestrator = test_orchestrator(store.clone());
        evaluate_definition(&store, &orchestrator, &definition).await.unwrap();
        evaluate_definition(&store, &orchestrator, &definition).await.unwrap();

        let active = store.list_active_run_ids(10).await.unwrap();
        assert_eq!(active.len(), 1, "second sweep must not start a duplicate run while the first is still active");
    }

    #[test]
    fn dynamic_partitioning_has_no_enumerable_candidates() {
        let partitioning = Partitioning::Dynamic {
            max_keys: None,
            retention_days: None,
        };
        assert!(candidate_partition_keys(Some(&partitioning), Utc::now()).is_empty());
    }

    #[test]
    fn time_window_partitioning_enumerates_lookback_keys() {
        let partitioning = Partitioning::TimeWindow {
            granularity: Granularity::Day,
            timezone: None,
            format: Some("YYYY-MM-DD".to_string()),
            lookback_windows: Some(2),
        };
        let now = chrono::DateTime::parse_from_rfc3339("2025-01-05T10:00:00Z").unwrap().with_timezone(&Utc);
        let keys = candidate_partition_keys(Some(&partitioning), now);
        assert_eq!(keys, vec![Some("2025-01-05".to_string()), Some("2025-01-04".to_string())]);
    }
}
