//! `StateStore`: the persistence seam between `catalog-engine` and Postgres
//! (`spec.md` §4.6).
//!
//! Every mutating operation that spans more than one row documents which
//! invariant it upholds transactionally — callers should never need to
//! wrap two calls in their own transaction to get a consistent result.

use async_trait::async_trait;
use catalog_core::{
    AssetDeclaration, AssetId, AssetMaterialization, AssetStalePartition, AuditLogEntry,
    AutoRunClaim, EngineError, EventTrigger, ExecutionHistoryEvent, JobBundle, JobBundleVersion,
    Schedule, Step, StepStatus, TriggerDelivery, WorkflowDefinition, WorkflowRun, WorkflowRunStep,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Input for creating a new definition version. The DAG must already be
/// validated by `catalog-dag::validate_and_compile` before reaching here.
#[derive(Debug, Clone)]
pub struct NewDefinition {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    pub triggers: Vec<catalog_core::TriggerSpec>,
    pub parameters_schema: Option<serde_json::Value>,
    pub default_parameters: serde_json::Value,
    pub output_schema: Option<serde_json::Value>,
    pub dag: catalog_core::DagMetadata,
}

/// Input for creating a run. `run_key_normalized` is produced by
/// `catalog-engine::runkey::normalize` before this reaches the store.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_definition_id: Uuid,
    pub run_key: Option<String>,
    pub run_key_normalized: Option<String>,
    pub parameters: serde_json::Value,
    pub triggered_by: catalog_core::TriggeredBy,
    pub trigger: Option<catalog_core::TriggerSnapshot>,
    pub partition_key: Option<String>,
    /// Run-creation-time resolved state, e.g. `resolvedBundles` (`spec.md`
    /// §4.1): each job step's `latest`/`pinned` binding resolved to a
    /// concrete bundle version once, up front, rather than at dispatch.
    pub context: serde_json::Value,
}

/// A step claimed for dispatch: `FOR UPDATE SKIP LOCKED` guarantees no two
/// orchestrator instances dispatch the same step twice.
#[derive(Debug, Clone)]
pub struct ClaimedStep {
    pub step: WorkflowRunStep,
    pub definition_step: Step,
}

/// A schedule claimed for evaluation by the scheduler loop.
#[derive(Debug, Clone)]
pub struct ClaimedSchedule {
    pub schedule: Schedule,
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // ---- Workflow definitions -------------------------------------------------

    async fn create_definition(
        &self,
        input: NewDefinition,
    ) -> Result<WorkflowDefinition, EngineError>;

    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinition, EngineError>;

    async fn get_latest_definition_by_slug(
        &self,
        slug: &str,
    ) -> Result<WorkflowDefinition, EngineError>;

    /// The latest version of every distinct slug, for the auto-materialize
    /// evaluator's poll loop (`spec.md` §4.5), which scans every definition's
    /// asset declarations rather than being told which ones to watch.
    async fn list_latest_definitions(&self) -> Result<Vec<WorkflowDefinition>, EngineError>;

    // ---- Runs -------------------------------------------------------------

    /// Creates a run. If `run_key_normalized` collides with a run still in
    /// `pending`/`running` for the same definition, returns
    /// `ErrorKind::Conflict` with the existing run id in `detail`
    /// (`spec.md` §4.2, §6 partial unique index).
    async fn create_run(&self, input: NewRun) -> Result<WorkflowRun, EngineError>;

    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, EngineError>;

    /// Lists up to `limit` non-terminal run ids, oldest first, for the
    /// worker poll loop to drive (`spec.md` §4.2: "a worker loop calls
    /// `tick` once per poll so many runs share the process"). Not a
    /// claim: concurrent workers may observe the same id and race into
    /// `tick`, which is safe since `claim_run`/`claim_ready_steps` are
    /// the actual dispatch-level locks.
    async fn list_active_run_ids(&self, limit: u32) -> Result<Vec<Uuid>, EngineError>;

    /// Every run created at or after `since`, across all definitions, for
    /// the analytics snapshot's 7-day window (`spec.md` §4.7). Analytics
    /// groups and aggregates these in-process rather than pushing
    /// per-workflow grouping into SQL, mirroring `list_active_run_ids`'s
    /// "fetch the rows, let the caller reduce them" shape.
    async fn list_runs_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkflowRun>, EngineError>;

    async fn create_run_steps(
        &self,
        run_id: Uuid,
        steps: Vec<WorkflowRunStep>,
    ) -> Result<(), EngineError>;

    async fn get_run_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowRunStep>, EngineError>;

    /// Claims up to `limit` unclaimed `pending` steps of `run_id`, locking
    /// the rows `FOR UPDATE SKIP LOCKED` so concurrent orchestrator ticks
    /// never double-dispatch a step. Dependency satisfaction is the
    /// orchestrator's concern: a step row only exists in `pending` once
    /// `catalog-engine::orchestrator` has already decided (via
    /// `DagMetadata`) that it is ready to run, so this call can claim
    /// blindly.
    async fn claim_ready_steps(
        &self,
        run_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ClaimedStep>, EngineError>;

    async fn update_step_status(
        &self,
        step_id: Uuid,
        status: StepStatus,
        output: Option<serde_json::Value>,
        failure: Option<catalog_core::FailureReason>,
        error_message: Option<String>,
    ) -> Result<(), EngineError>;

    async fn heartbeat_step(&self, step_id: Uuid, claim_owner: &str) -> Result<bool, EngineError>;

    /// Resets a failed-but-retryable step back to `pending` with an
    /// incremented `retryCount`, clearing its claim and prior failure so
    /// the next `claim_ready_steps` tick can pick it up for a fresh
    /// attempt (`spec.md` §4.3, §4.6 `FOR UPDATE` invariant).
    async fn schedule_retry(&self, step_id: Uuid, retry_count: u32) -> Result<(), EngineError>;

    /// Finds steps whose heartbeat has lapsed beyond `stale_after_ms` and
    /// still show `claimOwner` set, for crash recovery (`spec.md` §4.2).
    async fn reclaim_stale_steps(&self, stale_after_ms: i64) -> Result<Vec<Uuid>, EngineError>;

    /// Sets the run to a terminal status, stores its output (if any),
    /// clears `currentStepId`, and appends the terminal history event in
    /// one transaction (`spec.md` §4.6 invariant).
    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: catalog_core::RunStatus,
        error_message: Option<String>,
        output: Option<serde_json::Value>,
        history_event: ExecutionHistoryEvent,
    ) -> Result<WorkflowRun, EngineError>;

    async fn set_run_current_step(
        &self,
        run_id: Uuid,
        current_step_id: Option<String>,
    ) -> Result<(), EngineError>;

    /// Writes `claimOwner` on a `pending` run and transitions it to
    /// `running`, or confirms the caller already owns it. Fails with
    /// `ErrorKind::Conflict` if another owner holds a non-expired claim
    /// (`spec.md` §4.2 `startRun`).
    async fn claim_run(
        &self,
        run_id: Uuid,
        claim_owner: &str,
    ) -> Result<WorkflowRun, EngineError>;

    // ---- Asset ledger -------------------------------------------------------

    /// Records a materialization and marks the step complete in the same
    /// transaction (`spec.md` §4.4, §4.6 invariant).
    async fn record_materialization(
        &self,
        materialization: AssetMaterialization,
    ) -> Result<(), EngineError>;

    async fn get_latest_materialization(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<Option<AssetMaterialization>, EngineError>;

    async fn mark_stale(&self, stale: AssetStalePartition) -> Result<(), EngineError>;

    async fn clear_stale(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<(), EngineError>;

    async fn list_stale(
        &self,
        workflow_definition_id: Uuid,
    ) -> Result<Vec<AssetStalePartition>, EngineError>;

    /// Inserts or updates the `(workflowDefinitionId, assetId, partitionKey)`
    /// claim row the auto-materialize evaluator and `start_run` use to track
    /// in-flight runs and failure backoff (`spec.md` §4.2, §4.5).
    async fn upsert_auto_run_claim(&self, claim: AutoRunClaim) -> Result<AutoRunClaim, EngineError>;

    async fn get_auto_run_claim(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<Option<AutoRunClaim>, EngineError>;

    // ---- Job bundles --------------------------------------------------------

    /// Creates the bundle row for `slug` if absent, otherwise returns the
    /// existing one unchanged. `publish_bundle_version` calls this first so
    /// a version can always be inserted against a valid `bundle_id` FK.
    async fn upsert_bundle(
        &self,
        slug: &str,
        display_name: &str,
        description: Option<&str>,
    ) -> Result<JobBundle, EngineError>;

    /// Inserts a new bundle version and bumps `latest_version` on the
    /// parent bundle if published. Non-force publish against an existing
    /// `(bundle_id, version)` is a `Conflict` (`spec.md` §3); the `force`
    /// flag is handled by the caller re-issuing as a delete+insert inside a
    /// transaction is not exposed here — `catalog-engine::bundles` enforces
    /// the `force=true` replace semantics by calling this only after
    /// explicitly deleting the conflicting row when forcing.
    async fn publish_bundle_version(
        &self,
        version: JobBundleVersion,
    ) -> Result<JobBundleVersion, EngineError>;

    /// Removes a specific `(slug, version)` row; used to implement
    /// `force=true` republish. No-op (`Ok(())`) if absent.
    async fn delete_bundle_version(&self, slug: &str, version: i64) -> Result<(), EngineError>;

    async fn get_bundle(&self, slug: &str) -> Result<JobBundle, EngineError>;

    async fn get_latest_published_bundle_version(
        &self,
        slug: &str,
    ) -> Result<JobBundleVersion, EngineError>;

    async fn get_pinned_bundle_version(
        &self,
        slug: &str,
        version: i64,
    ) -> Result<JobBundleVersion, EngineError>;

    // ---- Schedules & triggers ------------------------------------------------

    async fn upsert_schedule(&self, schedule: Schedule) -> Result<Schedule, EngineError>;

    /// Claims schedules whose `nextRunAt` has elapsed, `FOR UPDATE SKIP
    /// LOCKED`, so only one scheduler instance fires each tick.
    async fn claim_due_schedules(&self, limit: u32) -> Result<Vec<ClaimedSchedule>, EngineError>;

    async fn create_event_trigger(&self, trigger: EventTrigger) -> Result<EventTrigger, EngineError>;

    /// Persists `lastFiredAt`/`consecutiveFailures`/`paused` changes made
    /// by `catalog-engine::scheduler::record_delivery_outcome` after each
    /// delivery attempt.
    async fn update_event_trigger(&self, trigger: EventTrigger) -> Result<EventTrigger, EngineError>;

    async fn list_event_triggers_for_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<EventTrigger>, EngineError>;

    async fn record_trigger_delivery(
        &self,
        delivery: TriggerDelivery,
    ) -> Result<(), EngineError>;

    // ---- History & audit ------------------------------------------------------

    async fn append_history_event(
        &self,
        event: ExecutionHistoryEvent,
    ) -> Result<(), EngineError>;

    async fn list_history_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<ExecutionHistoryEvent>, EngineError>;

    async fn append_audit_entry(&self, entry: AuditLogEntry) -> Result<(), EngineError>;
}

/// Helper shared by both backends: validates an asset declaration list
/// belongs to a known step before persisting (defensive; the DAG compiler
/// should have already guaranteed this).
pub(crate) fn assert_declarations_reference_known_steps(
    steps: &[Step],
    declarations: &[AssetDeclaration],
) -> Result<(), EngineError> {
    let ids: std::collections::HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    for decl in declarations {
        if !ids.contains(decl.step_id.as_str()) {
            return Err(EngineError::validation(format!(
                "asset declaration references unknown step '{}'",
                decl.step_id
            )));
        }
    }
    Ok(())
}
