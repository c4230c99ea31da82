//! `AnalyticsSource` backed by the state store, feeding
//! `catalog_events::spawn_analytics_task` (`spec.md` §4.7).
//!
//! Computes, over a 7-day trailing window: per-workflow totals, status
//! counts, success/failure rates, average duration, and failure-reason
//! breakdown, plus per-bucket (default 1h) run counts across every
//! workflow. `snapshot` classifies store errors into `Transient` (retried
//! next tick) or `Fatal` (self-suspends the task) by inspecting the
//! error's message for connection-level failure text, since `EngineError`
//! itself collapses every non-conflict/not-found storage failure into
//! `ErrorKind::Transient` (`spec.md` §4.7: "self-suspends on fatal DB
//! errors (e.g., connection refused, admin-terminated backend)").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use catalog_core::{EngineError, RunStatus, WorkflowRun};
use catalog_events::{AnalyticsError, AnalyticsSource};
use catalog_storage::StateStore;
use chrono::{DateTime, Duration, Utc};

/// Snapshot window for per-workflow stats (`spec.md` §4.7: "7-day window").
const STATS_WINDOW: Duration = Duration::days(7);
/// Default per-bucket width (`spec.md` §4.7: "default 1-hour buckets").
const DEFAULT_BUCKET_MS: i64 = 3_600_000;
/// Caps how many failed runs' step rows are inspected per workflow to build
/// `failureCategories`; a worker process samples rather than scanning an
/// unbounded failure history on every tick.
const FAILURE_SAMPLE_LIMIT: usize = 500;

fn bucket_width() -> Duration {
    let ms = std::env::var("APPHUB_ANALYTICS_BUCKET_MS")
        .ok()
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|ms| *ms > 0)
        .unwrap_or(DEFAULT_BUCKET_MS);
    Duration::milliseconds(ms)
}

pub struct StoreAnalyticsSource {
    store: Arc<dyn StateStore>,
}

impl StoreAnalyticsSource {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    async fn workflow_stats(&self, runs: &[WorkflowRun]) -> Result<Vec<serde_json::Value>, EngineError> {
        let mut by_workflow: HashMap<uuid::Uuid, Vec<&WorkflowRun>> = HashMap::new();
        for run in runs {
            by_workflow.entry(run.workflow_definition_id).or_default().push(run);
        }

        let mut out = Vec::with_capacity(by_workflow.len());
        for (workflow_definition_id, runs) in by_workflow {
            let total_runs = runs.len();
            let mut status_counts: HashMap<&'static str, usize> = HashMap::new();
            let mut duration_total_ms = 0i64;
            let mut duration_samples = 0i64;
            for run in &runs {
                *status_counts.entry(status_label(run.status)).or_insert(0) += 1;
                if let Some(duration_ms) = run.duration_ms {
                    duration_total_ms += duration_ms;
                    duration_samples += 1;
                }
            }

            let succeeded = *status_counts.get("succeeded").unwrap_or(&0);
            let failed = *status_counts.get("failed").unwrap_or(&0);
            let success_rate = if total_runs > 0 { succeeded as f64 / total_runs as f64 } else { 0.0 };
            let failure_rate = if total_runs > 0 { failed as f64 / total_runs as f64 } else { 0.0 };
            let average_duration_ms = if duration_samples > 0 {
                Some(duration_total_ms as f64 / duration_samples as f64)
            } else {
                None
            };

            let failure_categories = self.failure_categories(&runs).await?;

            out.push(serde_json::json!({
                "workflowDefinitionId": workflow_definition_id,
                "totalRuns": total_runs,
                "statusCounts": status_counts,
                "successRate": success_rate,
                "failureRate": failure_rate,
                "averageDurationMs": average_duration_ms,
                "failureCategories": failure_categories,
            }));
        }
        Ok(out)
    }

    /// Tallies `WorkflowRunStep::failureReason` across this workflow's
    /// failed runs in the window, capped at `FAILURE_SAMPLE_LIMIT` runs.
    async fn failure_categories(&self, runs: &[&WorkflowRun]) -> Result<HashMap<String, usize>, EngineError> {
        let mut failed_ids = runs.iter().filter(|r| r.status == RunStatus::Failed).map(|r| r.id);
        let mut categories: HashMap<String, usize> = HashMap::new();
        let mut inspected = 0usize;
        for run_id in failed_ids.by_ref() {
            if inspected >= FAILURE_SAMPLE_LIMIT {
                tracing::debug!(run_id = %run_id, "failureCategories sample limit reached; remaining failed runs not inspected");
                break;
            }
            inspected += 1;
            let steps = self.store.get_run_steps(run_id).await?;
            if let Some(reason) = steps.iter().rev().find_map(|s| s.failure_reason) {
                *categories.entry(failure_reason_label(reason).to_string()).or_insert(0) += 1;
            } else {
                *categories.entry("unknown".to_string()).or_insert(0) += 1;
            }
        }
        Ok(categories)
    }

    fn buckets(&self, runs: &[WorkflowRun], now: DateTime<Utc>) -> Vec<serde_json::Value> {
        let width = bucket_width();
        let mut by_bucket: HashMap<i64, (usize, usize, usize)> = HashMap::new();
        for run in runs {
            let bucket_index = (run.created_at - now).num_milliseconds().div_euclid(width.num_milliseconds());
            let entry = by_bucket.entry(bucket_index).or_insert((0, 0, 0));
            entry.0 += 1;
            match run.status {
                RunStatus::Succeeded => entry.1 += 1,
                RunStatus::Failed => entry.2 += 1,
                _ => {}
            }
        }

        let mut buckets: Vec<_> = by_bucket.into_iter().collect();
        buckets.sort_by_key(|(index, _)| *index);
        buckets
            .into_iter()
            .map(|(index, (total, succeeded, failed))| {
                let bucket_start = now + width * index as i32;
                serde_json::json!({
                    "bucketStart": bucket_start,
                    "totalRuns": total,
                    "succeeded": succeeded,
                    "failed": failed,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AnalyticsSource for StoreAnalyticsSource {
    async fn snapshot(&self, now: DateTime<Utc>) -> Result<serde_json::Value, AnalyticsError> {
        let active_runs = self.store.list_active_run_ids(10_000).await.map_err(classify)?;
        let window_start = now - STATS_WINDOW;
        let runs = self.store.list_runs_since(window_start).await.map_err(classify)?;

        let per_workflow = self.workflow_stats(&runs).await.map_err(classify)?;
        let buckets = self.buckets(&runs, now);

        Ok(serde_json::json!({
            "capturedAt": now,
            "activeRunCount": active_runs.len(),
            "windowStart": window_start,
            "perWorkflow": per_workflow,
            "buckets": buckets,
        }))
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::Canceled => "canceled",
    }
}

fn failure_reason_label(reason: catalog_core::FailureReason) -> &'static str {
    use catalog_core::FailureReason::*;
    match reason {
        Validation => "validation",
        Timeout => "timeout",
        HeartbeatLost => "heartbeat_lost",
        HandlerError => "handler_error",
        UpstreamUnavailable => "upstream_unavailable",
        Canceled => "canceled",
        Unknown => "unknown",
    }
}

/// Classifies a storage error as `Fatal` (self-suspend) when its message
/// indicates the connection itself is gone rather than a single query
/// failing transiently — text `sqlx`/Postgres actually produce for a
/// refused, reset, or administrator-terminated connection.
fn classify(err: EngineError) -> AnalyticsError {
    let lower = err.message.to_lowercase();
    let fatal = lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("terminating connection")
        || lower.contains("server closed the connection")
        || lower.contains("administrator command")
        || lower.contains("too many connections")
        || lower.contains("pool timed out");
    if fatal {
        AnalyticsError::Fatal(err.message)
    } else {
        AnalyticsError::Transient(err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{ErrorKind, FailureReason, TriggeredBy};
    use catalog_storage::{InMemoryStateStore, NewDefinition, NewRun};

    async fn definition(store: &InMemoryStateStore) -> catalog_core::WorkflowDefinition {
        store
            .create_definition(NewDefinition {
                slug: "demo".to_string(),
                name: "Demo".to_string(),
                description: None,
                steps: vec![],
                triggers: vec![],
                parameters_schema: None,
                default_parameters: serde_json::json!({}),
                output_schema: None,
                dag: Default::default(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn snapshot_reports_status_counts_and_rates() {
        let store = Arc::new(InMemoryStateStore::new());
        let def = definition(&store).await;

        let succeeded = store
            .create_run(NewRun {
                workflow_definition_id: def.id,
                run_key: None,
                run_key_normalized: None,
                parameters: serde_json::json!({}),
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
                context: serde_json::json!({}),
            })
            .await
            .unwrap();
        store
            .finalize_run(
                succeeded.id,
                RunStatus::Succeeded,
                None,
                None,
                catalog_core::ExecutionHistoryEvent {
                    id: uuid::Uuid::now_v7(),
                    workflow_run_id: succeeded.id,
                    workflow_run_step_id: None,
                    step_id: None,
                    event_type: catalog_core::HistoryEventType::RunCompleted,
                    event_payload: serde_json::json!({}),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let failed = store
            .create_run(NewRun {
                workflow_definition_id: def.id,
                run_key: None,
                run_key_normalized: None,
                parameters: serde_json::json!({}),
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
                context: serde_json::json!({}),
            })
            .await
            .unwrap();
        store
            .create_run_steps(
                failed.id,
                vec![catalog_core::WorkflowRunStep {
                    id: uuid::Uuid::now_v7(),
                    workflow_run_id: failed.id,
                    step_id: "a".to_string(),
                    status: catalog_core::StepStatus::Failed,
                    attempt: 1,
                    max_attempts: 1,
                    retry_count: 0,
                    claim_owner: None,
                    claimed_at: None,
                    heartbeat_at: None,
                    failure_reason: Some(FailureReason::Timeout),
                    error_message: Some("boom".to_string()),
                    job_run_id: None,
                    input: None,
                    output: None,
                    parent_step_id: None,
                    fanout_index: None,
                    template_step_id: None,
                    started_at: None,
                    completed_at: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                }],
            )
            .await
            .unwrap();
        store
            .finalize_run(
                failed.id,
                RunStatus::Failed,
                Some("boom".to_string()),
                None,
                catalog_core::ExecutionHistoryEvent {
                    id: uuid::Uuid::now_v7(),
                    workflow_run_id: failed.id,
                    workflow_run_step_id: None,
                    step_id: None,
                    event_type: catalog_core::HistoryEventType::RunCompleted,
                    event_payload: serde_json::json!({}),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let source = StoreAnalyticsSource::new(store.clone());
        let snapshot = source.snapshot(Utc::now()).await.unwrap();
        let per_workflow = snapshot["perWorkflow"].as_array().unwrap();
        assert_eq!(per_workflow.len(), 1);
        let stats = &per_workflow[0];
        assert_eq!(stats["totalRuns"], 2);
        assert_eq!(stats["successRate"], 0.5);
        assert_eq!(stats["failureRate"], 0.5);
        assert_eq!(stats["failureCategories"]["timeout"], 1);
    }

    #[test]
    fn classify_distinguishes_connection_failures_from_query_failures() {
        let conn_refused = EngineError::new(ErrorKind::Transient, "error communicating with database: Connection refused (os error 111)");
        assert!(matches!(classify(conn_refused), AnalyticsError::Fatal(_)));

        let admin_terminated = EngineError::new(ErrorKind::Transient, "terminating connection due to administrator command");
        assert!(matches!(classify(admin_terminated), AnalyticsError::Fatal(_)));

        let deadlock = EngineError::new(ErrorKind::Transient, "deadlock detected");
        assert!(matches!(classify(deadlock), AnalyticsError::Transient(_)));
    }
}
