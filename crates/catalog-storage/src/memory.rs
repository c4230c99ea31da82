//! In-memory [`StateStore`] for deterministic engine/orchestrator tests.
//!
//! Mirrors the Postgres backend's externally observable behavior (run-key
//! conflicts, terminal-status invariants) without a database, so
//! `catalog-engine`'s orchestrator tests can run without `DATABASE_URL`.

use std::collections::HashMap;

use async_trait::async_trait;
use catalog_core::{
    AssetId, AssetMaterialization, AssetStalePartition, AuditLogEntry, AutoRunClaim, BundleStatus,
    EngineError, EventTrigger, ExecutionHistoryEvent, FailureReason, JobBundle, JobBundleVersion,
    RunStatus, Schedule, StepStatus, TriggerDelivery, WorkflowDefinition, WorkflowRun,
    WorkflowRunStep,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::store::{ClaimedSchedule, ClaimedStep, NewDefinition, NewRun, StateStore};

#[derive(Default)]
struct Inner {
    definitions: HashMap<Uuid, WorkflowDefinition>,
    definitions_by_slug: HashMap<String, Vec<Uuid>>,
    runs: HashMap<Uuid, WorkflowRun>,
    active_run_keys: HashMap<(Uuid, String), Uuid>,
    run_steps: HashMap<Uuid, WorkflowRunStep>,
    run_steps_by_run: HashMap<Uuid, Vec<Uuid>>,
    materializations: HashMap<(Uuid, String, String), AssetMaterialization>,
    stale: HashMap<(Uuid, String, String), AssetStalePartition>,
    bundles: HashMap<String, JobBundle>,
    bundle_versions: HashMap<(Uuid, i64), JobBundleVersion>,
    schedules: HashMap<Uuid, Schedule>,
    event_triggers: HashMap<Uuid, EventTrigger>,
    trigger_deliveries: Vec<TriggerDelivery>,
    history: HashMap<Uuid, Vec<ExecutionHistoryEvent>>,
    audit: Vec<AuditLogEntry>,
    auto_run_claims: HashMap<(Uuid, String, String), AutoRunClaim>,
}

/// In-memory store. Cheaply `Clone`-able; all instances share state.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_definition(
        &self,
        input: NewDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        let mut inner = self.inner.lock();
        let id = Uuid::now_v7();
        let versions = inner.definitions_by_slug.entry(input.slug.clone()).or_default();
        let next_version = versions
            .iter()
            .filter_map(|id| inner.definitions.get(id).map(|d| d.version))
            .max()
            .unwrap_or(0)
            + 1;
        let now = Utc::now();
        let definition = WorkflowDefinition {
            id,
            slug: input.slug.clone(),
            name: input.name,
            version: next_version,
            description: input.description,
            steps: input.steps,
            triggers: input.triggers,
            parameters_schema: input.parameters_schema,
            default_parameters: input.default_parameters,
            output_schema: input.output_schema,
            metadata: serde_json::json!({}),
            dag: input.dag,
            created_at: now,
            updated_at: now,
        };
        inner.definitions_by_slug.entry(input.slug).or_default().push(id);
        inner.definitions.insert(id, definition.clone());
        Ok(definition)
    }

    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinition, EngineError> {
        self.inner
            .lock()
            .definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("definition {id} not found")))
    }

    async fn get_latest_definition_by_slug(
        &self,
        slug: &str,
    ) -> Result<WorkflowDefinition, EngineError> {
        let inner = self.inner.lock();
        let ids = inner
            .definitions_by_slug
            .get(slug)
            .ok_or_else(|| EngineError::not_found(format!("definition '{slug}' not found")))?;
        ids.iter()
            .filter_map(|id| inner.definitions.get(id))
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("definition '{slug}' not found")))
    }

    async fn list_latest_definitions(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        let inner = self.inner.lock();
        Ok(inner
            .definitions_by_slug
            .values()
            .filter_map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.definitions.get(id))
                    .max_by_key(|d| d.version)
                    .cloned()
            })
            .collect())
    }

    async fn create_run(&self, input: NewRun) -> Result<WorkflowRun, EngineError> {
        let mut inner = self.inner.lock();
        if let Some(normalized) = &input.run_key_normalized {
            let key = (input.workflow_definition_id, normalized.clone());
            if let Some(existing_id) = inner.active_run_keys.get(&key) {
                return Err(EngineError::conflict(
                    "an active run already exists for this run key",
                )
                .with_detail(serde_json::json!({"existingRunId": existing_id})));
            }
        }
        let id = Uuid::now_v7();
        let now = Utc::now();
        let run = WorkflowRun {
            id,
            workflow_definition_id: input.workflow_definition_id,
            status: RunStatus::Pending,
            run_key: input.run_key,
            run_key_normalized: input.run_key_normalized.clone(),
            parameters: input.parameters,
            context: input.context,
            output: None,
            error_message: None,
            current_step_index: None,
            metrics: None,
            triggered_by: input.triggered_by,
            trigger: input.trigger,
            partition_key: input.partition_key,
            claim_owner: None,
            current_step_id: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        };
        if let Some(normalized) = input.run_key_normalized {
            inner
                .active_run_keys
                .insert((input.workflow_definition_id, normalized), id);
        }
        inner.runs.insert(id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, EngineError> {
        self.inner
            .lock()
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("run {id} not found")))
    }

    async fn list_active_run_ids(&self, limit: u32) -> Result<Vec<Uuid>, EngineError> {
        let inner = self.inner.lock();
        let mut runs: Vec<&WorkflowRun> = inner
            .runs
            .values()
            .filter(|run| !run.is_terminal())
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs.into_iter().take(limit as usize).map(|run| run.id).collect())
    }

    async fn list_runs_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self
            .inner
            .lock()
            .runs
            .values()
            .filter(|run| run.created_at >= since)
            .cloned()
            .collect())
    }

    async fn create_run_steps(
        &self,
        run_id: Uuid,
        steps: Vec<WorkflowRunStep>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let ids = inner.run_steps_by_run.entry(run_id).or_default();
        for step in steps {
            ids.push(step.id);
            inner.run_steps.insert(step.id, step);
        }
        Ok(())
    }

    async fn get_run_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowRunStep>, EngineError> {
        let inner = self.inner.lock();
        let mut steps: Vec<WorkflowRunStep> = inner
            .run_steps_by_run
            .get(&run_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.run_steps.get(id).cloned())
            .collect();
        steps.sort_by(|a, b| (&a.step_id, a.fanout_index).cmp(&(&b.step_id, b.fanout_index)));
        Ok(steps)
    }

    async fn claim_ready_steps(
        &self,
        run_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ClaimedStep>, EngineError> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("run {run_id} not found")))?;
        let definition = inner
            .definitions
            .get(&run.workflow_definition_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("definition not found"))?;

        let mut candidate_ids: Vec<Uuid> = inner
            .run_steps_by_run
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| {
                inner
                    .run_steps
                    .get(id)
                    .map(|s| s.status == StepStatus::Pending && s.claim_owner.is_none())
                    .unwrap_or(false)
            })
            .collect();
        candidate_ids.sort_by_key(|id| {
            let step = &inner.run_steps[id];
            (step.step_id.clone(), step.fanout_index)
        });
        candidate_ids.truncate(limit as usize);

        let mut claimed = Vec::new();
        for id in candidate_ids {
            let step = inner.run_steps.get_mut(&id).expect("checked above");
            step.status = StepStatus::Running;
            step.claimed_at = Some(Utc::now());
            step.heartbeat_at = Some(Utc::now());
            step.started_at = step.started_at.or(Some(Utc::now()));
            step.attempt += 1;
            let definition_step = definition
                .steps
                .iter()
                .find(|s| s.id == step.step_id)
                .cloned()
                .ok_or_else(|| {
                    EngineError::fatal(format!(
                        "run step '{}' has no matching definition step",
                        step.step_id
                    ))
                })?;
            claimed.push(ClaimedStep {
                step: step.clone(),
                definition_step,
            });
        }
        Ok(claimed)
    }

    async fn update_step_status(
        &self,
        step_id: Uuid,
        status: StepStatus,
        output: Option<serde_json::Value>,
        failure: Option<FailureReason>,
        error_message: Option<String>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let step = inner
            .run_steps
            .get_mut(&step_id)
            .ok_or_else(|| EngineError::not_found(format!("run step {step_id} not found")))?;
        step.status = status;
        if let Some(output) = output {
            step.output = Some(output);
        }
        step.failure_reason = failure;
        step.error_message = error_message;
        if status.is_terminal() {
            step.completed_at = Some(Utc::now());
            step.claim_owner = None;
        }
        Ok(())
    }

    async fn heartbeat_step(&self, step_id: Uuid, claim_owner: &str) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock();
        if let Some(step) = inner.run_steps.get_mut(&step_id) {
            if step.status == StepStatus::Running {
                step.heartbeat_at = Some(Utc::now());
                step.claim_owner = Some(claim_owner.to_string());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn schedule_retry(&self, step_id: Uuid, retry_count: u32) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let step = inner
            .run_steps
            .get_mut(&step_id)
            .ok_or_else(|| EngineError::not_found(format!("run step {step_id} not found")))?;
        step.status = StepStatus::Pending;
        step.retry_count = retry_count;
        step.claim_owner = None;
        step.failure_reason = None;
        step.error_message = None;
        Ok(())
    }

    async fn reclaim_stale_steps(&self, stale_after_ms: i64) -> Result<Vec<Uuid>, EngineError> {
        let mut inner = self.inner.lock();
        let threshold = Utc::now() - chrono::Duration::milliseconds(stale_after_ms);
        let mut reclaimed = Vec::new();
        for step in inner.run_steps.values_mut() {
            if step.status == StepStatus::Running {
                if let Some(hb) = step.heartbeat_at {
                    if hb < threshold {
                        step.status = StepStatus::Pending;
                        step.claim_owner = None;
                        reclaimed.push(step.id);
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
        output: Option<serde_json::Value>,
        history_event: ExecutionHistoryEvent,
    ) -> Result<WorkflowRun, EngineError> {
        let mut inner = self.inner.lock();
        {
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| EngineError::not_found(format!("run {run_id} not found")))?;
            run.status = status;
            run.error_message = error_message;
            run.output = output.or(run.output.take());
            run.current_step_id = None;
            run.completed_at = Some(Utc::now());
            run.updated_at = Utc::now();
        }
        inner
            .history
            .entry(run_id)
            .or_default()
            .push(history_event);
        Ok(inner.runs[&run_id].clone())
    }

    async fn set_run_current_step(
        &self,
        run_id: Uuid,
        current_step_id: Option<String>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| EngineError::not_found(format!("run {run_id} not found")))?;
        run.current_step_id = current_step_id;
        run.status = RunStatus::Running;
        run.started_at = run.started_at.or(Some(Utc::now()));
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_run(&self, run_id: Uuid, claim_owner: &str) -> Result<WorkflowRun, EngineError> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| EngineError::not_found(format!("run {run_id} not found")))?;
        match &run.claim_owner {
            Some(existing) if existing != claim_owner => {
                return Err(EngineError::conflict(format!(
                    "run {run_id} is already claimed by {existing}"
                )))
            }
            _ => {}
        }
        run.claim_owner = Some(claim_owner.to_string());
        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            run.started_at = run.started_at.or(Some(Utc::now()));
        }
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn record_materialization(
        &self,
        materialization: AssetMaterialization,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let key = (
            materialization.workflow_definition_id,
            materialization.asset_id.as_str().to_string(),
            materialization.partition_key.clone().unwrap_or_default(),
        );
        inner.stale.remove(&key);
        inner.materializations.insert(key, materialization);
        Ok(())
    }

    async fn get_latest_materialization(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<Option<AssetMaterialization>, EngineError> {
        let key = (
            workflow_definition_id,
            asset_id.as_str().to_string(),
            partition_key.unwrap_or_default().to_string(),
        );
        Ok(self.inner.lock().materializations.get(&key).cloned())
    }

    async fn mark_stale(&self, stale: AssetStalePartition) -> Result<(), EngineError> {
        let key = (
            stale.workflow_definition_id,
            stale.asset_id.as_str().to_string(),
            stale.partition_key.clone().unwrap_or_default(),
        );
        self.inner.lock().stale.insert(key, stale);
        Ok(())
    }

    async fn clear_stale(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<(), EngineError> {
        let key = (
            workflow_definition_id,
            asset_id.as_str().to_string(),
            partition_key.unwrap_or_default().to_string(),
        );
        self.inner.lock().stale.remove(&key);
        Ok(())
    }

    async fn list_stale(
        &self,
        workflow_definition_id: Uuid,
    ) -> Result<Vec<AssetStalePartition>, EngineError> {
        Ok(self
            .inner
            .lock()
            .stale
            .values()
            .filter(|s| s.workflow_definition_id == workflow_definition_id)
            .cloned()
            .collect())
    }

    async fn upsert_auto_run_claim(&self, claim: AutoRunClaim) -> Result<AutoRunClaim, EngineError> {
        let mut inner = self.inner.lock();
        let key = (
            claim.workflow_definition_id,
            claim.asset_id.as_str().to_string(),
            claim.partition_key.clone().unwrap_or_default(),
        );
        let mut claim = claim;
        claim.updated_at = Utc::now();
        inner.auto_run_claims.insert(key, claim.clone());
        Ok(claim)
    }

    async fn get_auto_run_claim(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<Option<AutoRunClaim>, EngineError> {
        let key = (
            workflow_definition_id,
            asset_id.as_str().to_string(),
            partition_key.unwrap_or_default().to_string(),
        );
        Ok(self.inner.lock().auto_run_claims.get(&key).cloned())
    }

    async fn upsert_bundle(
        &self,
        slug: &str,
        display_name: &str,
        description: Option<&str>,
    ) -> Result<JobBundle, EngineError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.bundles.get(slug) {
            return Ok(existing.clone());
        }
        let bundle = JobBundle {
            id: Uuid::now_v7(),
            slug: slug.to_string(),
            display_name: display_name.to_string(),
            description: description.map(|d| d.to_string()),
            latest_version: None,
        };
        inner.bundles.insert(slug.to_string(), bundle.clone());
        Ok(bundle)
    }

    async fn publish_bundle_version(
        &self,
        version: JobBundleVersion,
    ) -> Result<JobBundleVersion, EngineError> {
        let mut inner = self.inner.lock();
        let key = (version.bundle_id, version.version);
        if inner.bundle_versions.contains_key(&key) {
            return Err(EngineError::conflict("bundle version already published")
                .with_detail(serde_json::json!({"slug": version.slug, "version": version.version})));
        }
        if version.status == BundleStatus::Published {
            if let Some(bundle) = inner.bundles.values_mut().find(|b| b.id == version.bundle_id) {
                bundle.latest_version = Some(bundle.latest_version.unwrap_or(0).max(version.version));
            }
        }
        inner.bundle_versions.insert(key, version.clone());
        Ok(version)
    }

    async fn delete_bundle_version(&self, slug: &str, version: i64) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if let Some(bundle) = inner.bundles.get(slug).cloned() {
            inner.bundle_versions.remove(&(bundle.id, version));
        }
        Ok(())
    }

    async fn get_bundle(&self, slug: &str) -> Result<JobBundle, EngineError> {
        self.inner
            .lock()
            .bundles
            .get(slug)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("bundle '{slug}' not found")))
    }

    async fn get_latest_published_bundle_version(
        &self,
        slug: &str,
    ) -> Result<JobBundleVersion, EngineError> {
        let inner = self.inner.lock();
        let bundle = inner
            .bundles
            .get(slug)
            .ok_or_else(|| EngineError::not_found(format!("bundle '{slug}' not found")))?;
        inner
            .bundle_versions
            .values()
            .filter(|v| v.bundle_id == bundle.id && v.is_published())
            .max_by_key(|v| v.version)
            .cloned()
            .ok_or_else(|| {
                EngineError::not_found(format!("no published version for bundle '{slug}'"))
            })
    }

    async fn get_pinned_bundle_version(
        &self,
        slug: &str,
        version: i64,
    ) -> Result<JobBundleVersion, EngineError> {
        let inner = self.inner.lock();
        let bundle = inner
            .bundles
            .get(slug)
            .ok_or_else(|| EngineError::not_found(format!("bundle '{slug}' not found")))?;
        inner
            .bundle_versions
            .get(&(bundle.id, version))
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("bundle '{slug}' has no version {version}")))
    }

    async fn upsert_schedule(&self, schedule: Schedule) -> Result<Schedule, EngineError> {
        let mut inner = self.inner.lock();
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn claim_due_schedules(&self, limit: u32) -> Result<Vec<ClaimedSchedule>, EngineError> {
        let inner = self.inner.lock();
        let now = Utc::now();
        let mut due: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|s| s.next_run_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit as usize);
        Ok(due.into_iter().map(|schedule| ClaimedSchedule { schedule }).collect())
    }

    async fn create_event_trigger(&self, trigger: EventTrigger) -> Result<EventTrigger, EngineError> {
        self.inner.lock().event_triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn update_event_trigger(&self, trigger: EventTrigger) -> Result<EventTrigger, EngineError> {
        let mut inner = self.inner.lock();
        if !inner.event_triggers.contains_key(&trigger.id) {
            return Err(EngineError::not_found(format!("event trigger {} not found", trigger.id)));
        }
        inner.event_triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn list_event_triggers_for_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<EventTrigger>, EngineError> {
        Ok(self
            .inner
            .lock()
            .event_triggers
            .values()
            .filter(|t| t.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn record_trigger_delivery(&self, delivery: TriggerDelivery) -> Result<(), EngineError> {
        self.inner.lock().trigger_deliveries.push(delivery);
        Ok(())
    }

    async fn append_history_event(&self, event: ExecutionHistoryEvent) -> Result<(), EngineError> {
        self.inner
            .lock()
            .history
            .entry(event.workflow_run_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_history_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<ExecutionHistoryEvent>, EngineError> {
        Ok(self.inner.lock().history.get(&run_id).cloned().unwrap_or_default())
    }

    async fn append_audit_entry(&self, entry: AuditLogEntry) -> Result<(), EngineError> {
        self.inner.lock().audit.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::TriggeredBy;

    fn sample_definition() -> NewDefinition {
        NewDefinition {
            slug: "demo".to_string(),
            name: "Demo".to_string(),
            description: None,
            steps: vec![],
            triggers: vec![],
            parameters_schema: None,
            default_parameters: serde_json::json!({}),
            output_schema: None,
            dag: Default::default(),
        }
    }

    #[tokio::test]
    async fn run_key_conflict_is_rejected_while_active() {
        let store = InMemoryStateStore::new();
        let def = store.create_definition(sample_definition()).await.unwrap();
        let first = store
            .create_run(NewRun {
                workflow_definition_id: def.id,
                run_key: Some("daily".to_string()),
                run_key_normalized: Some("daily".to_string()),
                parameters: serde_json::json!({}),
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
                context: serde_json::json!({}),
            })
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Pending);

        let conflict = store
            .create_run(NewRun {
                workflow_definition_id: def.id,
                run_key: Some("daily".to_string()),
                run_key_normalized: Some("daily".to_string()),
                parameters: serde_json::json!({}),
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
                context: serde_json::json!({}),
            })
            .await;
        assert!(conflict.is_err());
    }

    #[tokio::test]
    async fn definitions_version_monotonically_per_slug() {
        let store = InMemoryStateStore::new();
        let v1 = store.create_definition(sample_definition()).await.unwrap();
        let v2 = store.create_definition(sample_definition()).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        let latest = store.get_latest_definition_by_slug("demo").await.unwrap();
        assert_eq!(latest.id, v2.id);
    }

    #[tokio::test]
    async fn list_active_run_ids_excludes_terminal_runs() {
        let store = InMemoryStateStore::new();
        let def = store.create_definition(sample_definition()).await.unwrap();
        let pending = store
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
        let done = store
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
                done.id,
                RunStatus::Succeeded,
                None,
                None,
                ExecutionHistoryEvent {
                    id: Uuid::now_v7(),
                    workflow_run_id: done.id,
                    workflow_run_step_id: None,
                    step_id: None,
                    event_type: catalog_core::HistoryEventType::RunCompleted,
                    event_payload: serde_json::json!({}),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let active = store.list_active_run_ids(10).await.unwrap();
        assert_eq!(active, vec![pending.id]);
    }
}
