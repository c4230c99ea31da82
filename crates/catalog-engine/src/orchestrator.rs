//! Run orchestrator: drives a `WorkflowRun` to a terminal state
//! (`spec.md` §4.2), grounded on the replay/dispatch shape of
//! `everruns-durable::engine::executor::WorkflowExecutor` — a config
//! struct, a pure ready-computation step the async driver calls on every
//! tick, and `#[instrument]`-heavy public entry points.

use std::collections::HashMap;
use std::sync::Arc;

use catalog_core::{
    DagMetadata, EngineError, EventEnvelope, EventType, ExecutionHistoryEvent, FailureReason,
    HistoryEventType, RunStatus, Step, StepKind, StepStatus, TriggeredBy, WorkflowDefinition,
    WorkflowRun, WorkflowRunStep,
};
use catalog_events::{Bus, Origin};
use catalog_storage::{ClaimedStep, NewRun, StateStore};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::bundles::BundlePublisher;
use crate::executor::{evaluate_collection, AttemptOutcome, StepExecutor};
use crate::history::HistoryRecorder;
use crate::runkey;
use crate::{AssetLedger, MaterializationInput};

/// Default per-run concurrency cap (`spec.md` §5).
pub const DEFAULT_RUN_CONCURRENCY: usize = 4;
/// Default heartbeat-loss threshold (`spec.md` §4.2, §4.3).
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: i64 = 120_000;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub run_concurrency: usize,
    pub heartbeat_timeout_ms: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            run_concurrency: DEFAULT_RUN_CONCURRENCY,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

/// Input to create a run, before run-key normalization.
#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    pub workflow_definition_id: Uuid,
    pub parameters: Value,
    pub run_key: Option<String>,
    pub triggered_by: TriggeredBy,
    pub trigger: Option<catalog_core::TriggerSnapshot>,
    pub partition_key: Option<String>,
}

/// What one `tick` accomplished.
#[derive(Debug)]
pub enum TickOutcome {
    /// The run reached a terminal status this tick (or already had).
    Terminal(WorkflowRun),
    /// The run is still in progress; call `tick` again.
    InProgress,
}

/// Drives one `WorkflowRun` (or many, one at a time) to completion. Cheap
/// to construct per-process; the claim identity (`spec.md` §4.2 `claimOwner
/// = process + nonce`) is derived once from [`Origin::current`].
pub struct RunOrchestrator {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn Bus>,
    history: HistoryRecorder,
    assets: AssetLedger,
    bundles: BundlePublisher,
    executor: Arc<StepExecutor>,
    config: OrchestratorConfig,
    claim_owner: String,
    fanout_limiters: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl RunOrchestrator {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<dyn Bus>, executor: Arc<StepExecutor>, config: OrchestratorConfig) -> Self {
        let origin = Origin::current();
        Self {
            history: HistoryRecorder::new(store.clone()),
            assets: AssetLedger::new(store.clone()),
            bundles: BundlePublisher::new(store.clone()),
            store,
            bus,
            executor,
            config,
            claim_owner: format!("{}:{}", origin.process_id, origin.nonce),
            fanout_limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a run: normalizes the run key (conflict surfaces as
    /// `ErrorKind::Conflict` with the existing run id, `spec.md` §4.8),
    /// resolves every job step's `latest`/`pinned` bundle binding to a
    /// concrete version up front (`spec.md` §4.1) and stamps the result into
    /// `context.resolvedBundles`, records `run.created`, and publishes
    /// `workflow.run.pending`.
    #[instrument(skip(self, request))]
    pub async fn create_run(&self, request: CreateRunRequest) -> Result<WorkflowRun, EngineError> {
        let run_key_normalized = request.run_key.as_deref().map(runkey::normalize).transpose()?;
        let definition = self.store.get_definition(request.workflow_definition_id).await?;
        let context = self.resolve_bundle_context(&definition.steps).await?;

        let run = self
            .store
            .create_run(NewRun {
                workflow_definition_id: request.workflow_definition_id,
                run_key: request.run_key,
                run_key_normalized,
                parameters: request.parameters.clone(),
                triggered_by: request.triggered_by,
                trigger: request.trigger,
                partition_key: request.partition_key,
                context,
            })
            .await?;

        self.history.run_created(run.id, request.parameters).await?;
        self.publish(EventType::WorkflowRunPending, &run, serde_json::json!({"runId": run.id})).await;
        Ok(run)
    }

    /// Resolves every job step's bundle binding (direct, or nested inside a
    /// fan-out template) once, keyed by the step id a dispatched attempt
    /// actually carries — a fan-out child row reuses its parent step's id,
    /// so the template's own id is not the lookup key.
    async fn resolve_bundle_context(&self, steps: &[Step]) -> Result<Value, EngineError> {
        let mut resolved = serde_json::Map::new();
        for step in steps {
            let job = match &step.kind {
                StepKind::Job(job) => Some(job),
                StepKind::FanOut(fan_out) => match &fan_out.template.kind {
                    StepKind::Job(job) => Some(job),
                    _ => None,
                },
                StepKind::Service(_) => None,
            };
            let Some(binding) = job.and_then(|job| job.bundle.as_ref()) else {
                continue;
            };
            let version = self.bundles.resolve(binding).await?;
            resolved.insert(
                step.id.clone(),
                serde_json::json!({
                    "slug": version.slug,
                    "version": version.version,
                    "exportName": binding.export_name,
                    "checksum": version.checksum,
                }),
            );
        }
        Ok(serde_json::json!({ "resolvedBundles": resolved }))
    }

    /// Idempotent `pending -> running` transition. Claims the run by
    /// writing `claimOwner`; a no-op if the run is already terminal or
    /// already owned by this instance.
    #[instrument(skip(self))]
    pub async fn start_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }
        let run = self.store.claim_run(run_id, &self.claim_owner).await?;
        self.history.run_started(run_id).await?;
        self.publish(EventType::WorkflowRunRunning, &run, Value::Null).await;
        Ok(run)
    }

    /// Cooperative cancellation (`spec.md` §4.2, §5): marks the run
    /// `canceled`, skips every step that has not yet been claimed, and
    /// lets already-`running` steps finish (their result is discarded
    /// since the run is already terminal by the time they complete).
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid, reason: Option<String>) -> Result<WorkflowRun, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }
        for step in self.store.get_run_steps(run_id).await? {
            if step.status == StepStatus::Pending {
                self.store
                    .update_step_status(step.id, StepStatus::Failed, None, Some(FailureReason::Canceled), reason.clone())
                    .await?;
            }
        }
        let finalized = self.finalize(run_id, RunStatus::Canceled, reason, None).await?;
        self.publish(EventType::WorkflowRunCanceled, &finalized, Value::Null).await;
        Ok(finalized)
    }

    /// Advances `run_id` by one step: plans newly ready/skipped steps,
    /// dispatches available capacity, recomputes `currentStepId`, and
    /// finalizes if the run is done. Callers (a worker poll loop, or
    /// tests) call this repeatedly until it returns `Terminal`.
    #[instrument(skip(self))]
    pub async fn tick(&self, run_id: Uuid) -> Result<TickOutcome, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(TickOutcome::Terminal(run));
        }

        let definition = self.store.get_definition(run.workflow_definition_id).await?;
        let existing = self.store.get_run_steps(run_id).await?;
        let plan = plan_run(&definition.dag, &definition, &existing);

        for step_id in &plan.to_skip {
            let now = Utc::now();
            let row = WorkflowRunStep {
                id: Uuid::now_v7(),
                workflow_run_id: run_id,
                step_id: step_id.clone(),
                status: StepStatus::Skipped,
                attempt: 0,
                max_attempts: definition.step(step_id).map(|s| s.retry_policy().max_attempts).unwrap_or(1),
                retry_count: 0,
                claim_owner: None,
                claimed_at: None,
                heartbeat_at: None,
                failure_reason: None,
                error_message: None,
                job_run_id: None,
                input: None,
                output: None,
                parent_step_id: None,
                fanout_index: None,
                template_step_id: None,
                started_at: Some(now),
                completed_at: Some(now),
                created_at: now,
                updated_at: now,
            };
            self.store.create_run_steps(run_id, vec![row]).await?;
            self.history.step_skipped(run_id, step_id, "all dependencies skipped").await?;
        }

        if !plan.to_dispatch.is_empty() {
            let rows: Vec<WorkflowRunStep> = plan
                .to_dispatch
                .iter()
                .map(|step_id| pending_row(run_id, step_id, &definition))
                .collect();
            self.store.create_run_steps(run_id, rows).await?;
        }

        if let Some(offending_step_id) = &plan.run_failed {
            let refreshed = self.store.get_run_steps(run_id).await?;
            let message = refreshed
                .iter()
                .find(|s| &s.step_id == offending_step_id && s.parent_step_id.is_none())
                .and_then(|s| s.error_message.clone())
                .unwrap_or_else(|| format!("step '{offending_step_id}' failed"));
            let finalized = self.finalize(run_id, RunStatus::Failed, Some(message), None).await?;
            self.publish(EventType::WorkflowRunFailed, &finalized, Value::Null).await;
            return Ok(TickOutcome::Terminal(finalized));
        }

        if plan.all_done {
            let refreshed = self.store.get_run_steps(run_id).await?;
            let output = assemble_output(&definition, &refreshed);
            let finalized = self.finalize(run_id, RunStatus::Succeeded, None, output).await?;
            self.publish(EventType::WorkflowRunSucceeded, &finalized, Value::Null).await;
            return Ok(TickOutcome::Terminal(finalized));
        }

        self.reclaim_heartbeats(run_id, &definition, &existing).await?;

        let running_count = existing.iter().filter(|s| s.status == StepStatus::Running).count();
        let available = self.config.run_concurrency.saturating_sub(running_count);
        if available > 0 {
            let claimed = self.store.claim_ready_steps(run_id, available as u32).await?;
            if !claimed.is_empty() {
                self.dispatch(&run, claimed).await?;
            }
        }

        let refreshed = self.store.get_run_steps(run_id).await?;
        let current = next_current_step(&definition.dag, &definition, &refreshed);
        self.store.set_run_current_step(run_id, current).await?;

        Ok(TickOutcome::InProgress)
    }

    /// Drives `run_id` to completion by calling [`Self::tick`] until it
    /// returns `Terminal`. Intended for tests and single-replica
    /// deployments; a multi-replica worker loop instead calls `tick` once
    /// per poll so many runs share the process.
    pub async fn drive(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        self.start_run(run_id).await?;
        loop {
            match self.tick(run_id).await? {
                TickOutcome::Terminal(run) => return Ok(run),
                TickOutcome::InProgress => continue,
            }
        }
    }

    async fn dispatch(&self, run: &WorkflowRun, claimed: Vec<ClaimedStep>) -> Result<(), EngineError> {
        let mut tasks = FuturesUnordered::new();
        for item in claimed {
            if item.step.parent_step_id.is_none() {
                if let StepKind::FanOut(fan_out) = &item.definition_step.kind {
                    self.expand_fan_out(run, &item.step, fan_out).await?;
                    continue;
                }
            }
            tasks.push(self.run_attempt(run, item));
        }
        while tasks.next().await.is_some() {}
        Ok(())
    }

    async fn expand_fan_out(
        &self,
        run: &WorkflowRun,
        parent: &WorkflowRunStep,
        fan_out: &catalog_core::FanOutStep,
    ) -> Result<(), EngineError> {
        let step_outputs = output_map(&self.store.get_run_steps(run.id).await?);
        let items = match evaluate_collection(&fan_out.collection, &run.parameters, &run.context, &step_outputs, fan_out.max_items) {
            Ok(items) => items,
            Err(err) => {
                self.store
                    .update_step_status(parent.id, StepStatus::Failed, None, Some(FailureReason::Validation), Some(err.message))
                    .await?;
                self.history.step_failed(run.id, parent.id, &parent.step_id, Value::Null).await?;
                return Ok(());
            }
        };

        self.fanout_limiters
            .lock()
            .insert(parent.id, Arc::new(Semaphore::new(fan_out.max_concurrency.unwrap_or(self.config.run_concurrency as u32).max(1) as usize)));

        let now = Utc::now();
        let rows: Vec<WorkflowRunStep> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| WorkflowRunStep {
                id: Uuid::now_v7(),
                workflow_run_id: run.id,
                step_id: parent.step_id.clone(),
                status: StepStatus::Pending,
                attempt: 0,
                max_attempts: fan_out.template.retry_policy().max_attempts,
                retry_count: 0,
                claim_owner: None,
                claimed_at: None,
                heartbeat_at: None,
                failure_reason: None,
                error_message: None,
                job_run_id: None,
                input: Some(item),
                output: None,
                parent_step_id: Some(parent.id),
                fanout_index: Some(index as i32),
                template_step_id: Some(fan_out.template.id.clone()),
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let child_count = rows.len();
        self.store.create_run_steps(run.id, rows).await?;
        self.history.fanout_expanded(run.id, &parent.step_id, child_count).await?;
        Ok(())
    }

    async fn run_attempt(&self, run: &WorkflowRun, claimed: ClaimedStep) {
        let step_def = effective_step(&claimed.step, &claimed.definition_step);

        let permit = claimed
            .step
            .parent_step_id
            .and_then(|parent_id| self.fanout_limiters.lock().get(&parent_id).cloned());
        let _permit = match &permit {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        self.history
            .step_started(run.id, claimed.step.id, &claimed.step.step_id, claimed.step.input.clone().unwrap_or(Value::Null))
            .await
            .ok();

        // A fan-out child's `input` (its slice of the collection) stands in
        // for the run's top-level parameters; a plain step uses the run's
        // parameters directly.
        let parameters = claimed.step.input.as_ref().unwrap_or(&run.parameters);
        let outcome = self
            .executor
            .attempt(&self.store, &step_def, &claimed.step, &self.claim_owner, parameters, &run.context)
            .await;

        if let Err(err) = self.apply_attempt_outcome(run, &step_def, &claimed.step, outcome).await {
            warn!(error = %err, step_id = %claimed.step.step_id, "failed to persist step attempt outcome");
        }
    }

    async fn apply_attempt_outcome(
        &self,
        run: &WorkflowRun,
        step_def: &Step,
        claimed: &WorkflowRunStep,
        outcome: AttemptOutcome,
    ) -> Result<(), EngineError> {
        match outcome {
            AttemptOutcome::Succeeded { output, produced_assets } => {
                for produced in produced_assets {
                    if let Some(decl) = step_def
                        .asset_declarations
                        .iter()
                        .find(|d| d.direction == catalog_core::AssetDirection::Produces && d.asset_id.as_str() == produced.asset_id)
                    {
                        let materialization = self
                            .assets
                            .record(MaterializationInput {
                                workflow_definition_id: run.workflow_definition_id,
                                workflow_run_id: run.id,
                                workflow_run_step_id: claimed.id,
                                step_id: claimed.step_id.clone(),
                                declaration: decl.clone(),
                                partition_key: produced.partition_key.clone(),
                                payload: produced.payload.clone(),
                            })
                            .await?;
                        self.history.asset_materialized(run.id, &claimed.step_id, decl.asset_id.as_str()).await?;
                        self.publish(
                            EventType::AssetProduced,
                            run,
                            serde_json::json!({"assetId": materialization.asset_id.as_str(), "partitionKey": materialization.partition_key}),
                        )
                        .await;
                    } else {
                        warn!(asset_id = %produced.asset_id, step_id = %claimed.step_id, "produced asset has no matching declaration; discarding");
                    }
                }
                self.store.update_step_status(claimed.id, StepStatus::Succeeded, output.clone(), None, None).await?;
                self.history.step_completed(run.id, claimed.id, &claimed.step_id, output.unwrap_or(Value::Null)).await
            }
            AttemptOutcome::Failed { reason, message, retryable } => {
                let retry_policy = step_def.retry_policy();
                let next_attempt = claimed.attempt;
                if retryable && retry_policy.should_retry(next_attempt) {
                    self.store
                        .update_step_status(claimed.id, StepStatus::Failed, None, Some(reason), Some(message))
                        .await?;
                    self.history.step_failed(run.id, claimed.id, &claimed.step_id, Value::Null).await?;
                    let retry_count = claimed.retry_count + 1;
                    self.store.schedule_retry(claimed.id, retry_count).await?;
                    self.history.step_retrying(run.id, claimed.id, &claimed.step_id, next_attempt).await
                } else {
                    self.store
                        .update_step_status(claimed.id, StepStatus::Failed, None, Some(reason), Some(message))
                        .await?;
                    self.history.step_failed(run.id, claimed.id, &claimed.step_id, Value::Null).await
                }
            }
        }
    }

    async fn reclaim_heartbeats(&self, run_id: Uuid, definition: &WorkflowDefinition, existing: &[WorkflowRunStep]) -> Result<(), EngineError> {
        let threshold = Utc::now() - chrono::Duration::milliseconds(self.config.heartbeat_timeout_ms);
        for step in existing {
            if step.status != StepStatus::Running {
                continue;
            }
            let last_seen = step.heartbeat_at.or(step.claimed_at);
            let is_stale = last_seen.map(|t| t < threshold).unwrap_or(false);
            if !is_stale {
                continue;
            }
            let step_def = definition
                .step(&step.step_id)
                .map(|definition_step| effective_step(step, definition_step))
                .unwrap_or_else(|| step_placeholder(&step.step_id));
            let message = format!("no heartbeat for {}ms", self.config.heartbeat_timeout_ms);
            let outcome = AttemptOutcome::Failed {
                reason: FailureReason::HeartbeatLost,
                message,
                retryable: true,
            };
            let run = self.store.get_run(run_id).await?;
            self.apply_attempt_outcome(&run, &step_def, step, outcome).await?;
        }
        Ok(())
    }

    async fn finalize(&self, run_id: Uuid, status: RunStatus, error_message: Option<String>, output: Option<Value>) -> Result<WorkflowRun, EngineError> {
        let payload = serde_json::json!({"status": status, "errorMessage": error_message, "output": output});
        let history_event = ExecutionHistoryEvent {
            id: Uuid::now_v7(),
            workflow_run_id: run_id,
            workflow_run_step_id: None,
            step_id: None,
            event_type: HistoryEventType::RunCompleted,
            event_payload: payload,
            created_at: Utc::now(),
        };
        self.store.finalize_run(run_id, status, error_message, output, history_event).await
    }

    async fn publish(&self, event_type: EventType, run: &WorkflowRun, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.entry("runId").or_insert_with(|| Value::String(run.id.to_string()));
        }
        let envelope = EventEnvelope::new(event_type, "catalog-engine", payload).with_workflow_meta(catalog_core::ApphubWorkflowMeta {
            workflow_definition_id: Some(run.workflow_definition_id),
            workflow_run_id: Some(run.id),
            workflow_run_step_id: None,
            job_run_id: None,
            job_slug: None,
        });
        if let Err(err) = self.bus.publish(envelope).await {
            warn!(error = %err, "event bus publish failed");
        }
    }
}

/// Resolves the `Step` that actually governs one attempt: for a fan-out
/// child row (`parentStepId` set), that's the fan-out's `template`, not
/// the `FanOut` step itself (child rows reuse the parent's `stepId`, see
/// `spec.md` §4.3).
fn effective_step(step: &WorkflowRunStep, definition_step: &Step) -> Step {
    if step.parent_step_id.is_some() {
        if let StepKind::FanOut(fan_out) = &definition_step.kind {
            return (*fan_out.template).clone();
        }
    }
    definition_step.clone()
}

fn step_placeholder(step_id: &str) -> Step {
    Step {
        id: step_id.to_string(),
        name: step_id.to_string(),
        description: None,
        depends_on: Vec::new(),
        retry_policy: None,
        asset_declarations: Vec::new(),
        kind: StepKind::Job(catalog_core::JobStep {
            job_slug: step_id.to_string(),
            bundle: None,
            timeout_ms: None,
        }),
    }
}

fn pending_row(run_id: Uuid, step_id: &str, definition: &WorkflowDefinition) -> WorkflowRunStep {
    let now = Utc::now();
    let max_attempts = definition.step(step_id).map(|s| s.retry_policy().max_attempts).unwrap_or(1);
    WorkflowRunStep {
        id: Uuid::now_v7(),
        workflow_run_id: run_id,
        step_id: step_id.to_string(),
        status: StepStatus::Pending,
        attempt: 0,
        max_attempts,
        retry_count: 0,
        claim_owner: None,
        claimed_at: None,
        heartbeat_at: None,
        failure_reason: None,
        error_message: None,
        job_run_id: None,
        input: None,
        output: None,
        parent_step_id: None,
        fanout_index: None,
        template_step_id: None,
        started_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn output_map(steps: &[WorkflowRunStep]) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    for step in steps {
        if step.parent_step_id.is_some() {
            continue;
        }
        if let Some(output) = &step.output {
            map.insert(step.step_id.clone(), output.clone());
        }
    }
    map
}

/// The smallest topological index among this run's steps that is not yet
/// terminal, or `None` once every real step has a terminal row
/// (`spec.md` §4.2: "recompute the run's currentStepId/currentStepIndex").
fn next_current_step(dag: &DagMetadata, definition: &WorkflowDefinition, steps: &[WorkflowRunStep]) -> Option<String> {
    let status_by_step: HashMap<&str, StepStatus> = steps
        .iter()
        .filter(|s| s.parent_step_id.is_none())
        .map(|s| (s.step_id.as_str(), s.status))
        .collect();

    dag.order
        .iter()
        .filter(|id| definition.step(id).is_some())
        .find(|id| !matches!(status_by_step.get(id.as_str()), Some(status) if status.is_terminal()))
        .cloned()
}

/// Assembles the run's output from the last topologically-ordered
/// succeeded step's output (`spec.md` §4.2: "assembled from the last
/// producing step"). A definition with an explicit `output_schema` is
/// expected to shape its own aggregation upstream of this helper; absent
/// one, the last producer's output is a reasonable default.
fn assemble_output(definition: &WorkflowDefinition, steps: &[WorkflowRunStep]) -> Option<Value> {
    let status_by_step: HashMap<&str, &WorkflowRunStep> = steps
        .iter()
        .filter(|s| s.parent_step_id.is_none())
        .map(|s| (s.step_id.as_str(), s))
        .collect();

    definition
        .dag
        .order
        .iter()
        .rev()
        .filter(|id| definition.step(id).is_some())
        .find_map(|id| status_by_step.get(id.as_str()).and_then(|s| s.output.clone()))
}

/// Result of one pass of ready-set computation over the DAG.
#[derive(Debug, Default, PartialEq)]
pub struct ReadyPlan {
    /// Step ids with no existing row that are ready to run; the caller
    /// materializes them as `pending` rows.
    pub to_dispatch: Vec<String>,
    /// Step ids with no existing row whose dependencies are all `skipped`
    /// (skip propagates); the caller materializes them directly as
    /// `skipped` rows.
    pub to_skip: Vec<String>,
    /// Set once an existing row has terminally failed — the run fails
    /// with this step as the offending one (`spec.md` §4.2; no tolerance
    /// policy, §7).
    pub run_failed: Option<String>,
    /// `true` once every real step has a terminal (`succeeded`|`skipped`)
    /// row and nothing failed.
    pub all_done: bool,
}

/// Pure ready-set computation (`spec.md` §4.2): processes `dag.order` (a
/// stable topological order) once, so a step's dependencies are always
/// already resolved — including ones planned earlier in this same pass —
/// by the time the step itself is evaluated.
pub fn plan_run(dag: &DagMetadata, definition: &WorkflowDefinition, existing: &[WorkflowRunStep]) -> ReadyPlan {
    let mut status_by_step: HashMap<&str, StepStatus> = HashMap::new();
    for row in existing {
        if row.parent_step_id.is_none() {
            status_by_step.insert(row.step_id.as_str(), row.status);
        }
    }

    let mut to_dispatch = Vec::new();
    let mut to_skip = Vec::new();
    let mut run_failed: Option<String> = None;

    for step_id in &dag.order {
        let Some(step) = definition.step(step_id) else {
            continue; // fan-out template pseudo-node; not a dispatchable node
        };

        if let Some(status) = status_by_step.get(step_id.as_str()) {
            if *status == StepStatus::Failed {
                run_failed.get_or_insert_with(|| step_id.clone());
            }
            continue;
        }

        if step.depends_on.is_empty() {
            to_dispatch.push(step_id.clone());
            status_by_step.insert(step_id.as_str(), StepStatus::Pending);
            continue;
        }

        let mut any_unresolved = false;
        let mut any_failed = false;
        let mut any_succeeded = false;
        let mut any_skipped = false;
        for dep in &step.depends_on {
            match status_by_step.get(dep.as_str()) {
                Some(StepStatus::Succeeded) => any_succeeded = true,
                Some(StepStatus::Skipped) => any_skipped = true,
                Some(StepStatus::Failed) => any_failed = true,
                _ => any_unresolved = true,
            }
        }

        if any_failed || any_unresolved {
            continue;
        }

        if any_succeeded {
            to_dispatch.push(step_id.clone());
            status_by_step.insert(step_id.as_str(), StepStatus::Pending);
        } else {
            debug_assert!(any_skipped);
            to_skip.push(step_id.clone());
            status_by_step.insert(step_id.as_str(), StepStatus::Skipped);
        }
    }

    let all_done = run_failed.is_none()
        && to_dispatch.is_empty()
        && to_skip.is_empty()
        && dag
            .order
            .iter()
            .filter(|id| definition.step(id).is_some())
            .all(|id| matches!(status_by_step.get(id.as_str()), Some(StepStatus::Succeeded) | Some(StepStatus::Skipped)));

    ReadyPlan {
        to_dispatch,
        to_skip,
        run_failed,
        all_done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{JobStep, RetryPolicy};
    use chrono::Utc;

    fn job_step(id: &str, depends_on: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            retry_policy: None,
            asset_declarations: Vec::new(),
            kind: StepKind::Job(JobStep {
                job_slug: id.to_string(),
                bundle: None,
                timeout_ms: None,
            }),
        }
    }

    fn definition_of(steps: Vec<Step>) -> WorkflowDefinition {
        let (normalized, dag) = catalog_dag::validate_and_compile(steps).unwrap();
        WorkflowDefinition {
            id: Uuid::now_v7(),
            slug: "wf".to_string(),
            name: "wf".to_string(),
            version: 1,
            description: None,
            steps: normalized,
            triggers: Vec::new(),
            parameters_schema: None,
            default_parameters: Value::Null,
            output_schema: None,
            metadata: Value::Null,
            dag,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn terminal_row(step_id: &str, status: StepStatus) -> WorkflowRunStep {
        let now = Utc::now();
        WorkflowRunStep {
            id: Uuid::now_v7(),
            workflow_run_id: Uuid::now_v7(),
            step_id: step_id.to_string(),
            status,
            attempt: 1,
            max_attempts: 1,
            retry_count: 0,
            claim_owner: None,
            claimed_at: None,
            heartbeat_at: None,
            failure_reason: None,
            error_message: None,
            job_run_id: None,
            input: None,
            output: None,
            parent_step_id: None,
            fanout_index: None,
            template_step_id: None,
            started_at: Some(now),
            completed_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn linear_chain_becomes_ready_one_layer_at_a_time() {
        let definition = definition_of(vec![job_step("a", &[]), job_step("b", &["a"]), job_step("c", &["b"])]);
        let plan = plan_run(&definition.dag, &definition, &[]);
        assert_eq!(plan.to_dispatch, vec!["a".to_string()]);
        assert!(!plan.all_done);

        let existing = vec![terminal_row("a", StepStatus::Succeeded)];
        let plan = plan_run(&definition.dag, &definition, &existing);
        assert_eq!(plan.to_dispatch, vec!["b".to_string()]);
    }

    #[test]
    fn skip_propagates_when_all_deps_skipped() {
        let definition = definition_of(vec![job_step("a", &[]), job_step("b", &["a"])]);
        let existing = vec![terminal_row("a", StepStatus::Skipped)];
        let plan = plan_run(&definition.dag, &definition, &existing);
        assert_eq!(plan.to_skip, vec!["b".to_string()]);
    }

    #[test]
    fn downstream_runs_normally_if_any_dep_succeeded() {
        let definition = definition_of(vec![job_step("a", &[]), job_step("b", &[]), job_step("c", &["a", "b"])]);
        let existing = vec![terminal_row("a", StepStatus::Succeeded), terminal_row("b", StepStatus::Skipped)];
        let plan = plan_run(&definition.dag, &definition, &existing);
        assert_eq!(plan.to_dispatch, vec!["c".to_string()]);
    }

    #[test]
    fn failed_step_halts_downstream_and_is_reported() {
        let definition = definition_of(vec![job_step("a", &[]), job_step("b", &["a"])]);
        let existing = vec![terminal_row("a", StepStatus::Failed)];
        let plan = plan_run(&definition.dag, &definition, &existing);
        assert_eq!(plan.run_failed, Some("a".to_string()));
        assert!(plan.to_dispatch.is_empty());
        assert!(plan.to_skip.is_empty());
    }

    #[test]
    fn all_succeeded_is_all_done() {
        let definition = definition_of(vec![job_step("a", &[])]);
        let existing = vec![terminal_row("a", StepStatus::Succeeded)];
        let plan = plan_run(&definition.dag, &definition, &existing);
        assert!(plan.all_done);
    }

    #[test]
    fn next_current_step_is_first_nonterminal() {
        let definition = definition_of(vec![job_step("a", &[]), job_step("b", &["a"])]);
        let existing = vec![terminal_row("a", StepStatus::Succeeded)];
        assert_eq!(next_current_step(&definition.dag, &definition, &existing), Some("b".to_string()));
    }

    #[test]
    fn retry_policy_default_is_no_retry() {
        assert_eq!(RetryPolicy::default().max_attempts, 1);
    }
}

/// End-to-end tests driving [`RunOrchestrator`] against an in-memory store,
/// an in-process [`catalog_events::InlineBus`], and a scripted job handler —
/// the async counterpart to `plan_run`'s pure unit tests above, covering the
/// literal scenarios in `spec.md` §8.
#[cfg(test)]
mod drive_tests {
    use super::*;
    use async_trait::async_trait;
    use catalog_core::{AssetDeclaration, AssetDirection, AssetId, FanOutStep, JobStep, RetryPolicy};
    use catalog_events::InlineBus;
    use catalog_storage::{InMemoryStateStore, NewDefinition, StateStore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    use crate::executor::{JobContext, JobHandler, JobHandlerRegistry, JobOutcome, ProducedAsset};

    /// Always succeeds, echoing its parameters back as output.
    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, ctx: JobContext<'_>) -> Result<JobOutcome, EngineError> {
            Ok(JobOutcome {
                output: Some(ctx.parameters.clone()),
                produced_assets: Vec::new(),
            })
        }
    }

    /// Produces one declared asset alongside its output.
    struct AssetProducingHandler {
        asset_id: String,
    }

    #[async_trait]
    impl JobHandler for AssetProducingHandler {
        async fn handle(&self, _ctx: JobContext<'_>) -> Result<JobOutcome, EngineError> {
            Ok(JobOutcome {
                output: Some(serde_json::json!({"done": true})),
                produced_assets: vec![ProducedAsset {
                    asset_id: self.asset_id.clone(),
                    partition_key: None,
                    payload: Some(serde_json::json!({"rows": 10})),
                }],
            })
        }
    }

    /// Fails its first `fail_times` invocations with a retryable error, then
    /// succeeds; tracks the attempt count it was called with.
    struct FlakyHandler {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _ctx: JobContext<'_>) -> Result<JobOutcome, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                Err(EngineError::new(catalog_core::ErrorKind::Transient, "transient upstream error"))
            } else {
                Ok(JobOutcome::default())
            }
        }
    }

    /// Claims the step, then never heartbeats or returns — used to exercise
    /// heartbeat-loss recovery. Signals its invocation via a oneshot so the
    /// test can wait for the attempt to be in flight before advancing time.
    struct HangingHandler {
        started: AsyncMutex<Option<tokio::sync::oneshot::Sender<()>>>,
    }

    #[async_trait]
    impl JobHandler for HangingHandler {
        async fn handle(&self, _ctx: JobContext<'_>) -> Result<JobOutcome, EngineError> {
            if let Some(tx) = self.started.lock().await.take() {
                let _ = tx.send(());
            }
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn job(id: &str, depends_on: &[&str], job_slug: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            retry_policy: None,
            asset_declarations: Vec::new(),
            kind: StepKind::Job(JobStep {
                job_slug: job_slug.to_string(),
                bundle: None,
                timeout_ms: None,
            }),
        }
    }

    async fn make_definition(store: &InMemoryStateStore, steps: Vec<Step>) -> WorkflowDefinition {
        let (normalized, dag) = catalog_dag::validate_and_compile(steps).unwrap();
        store
            .create_definition(NewDefinition {
                slug: format!("wf-{}", Uuid::now_v7()),
                name: "wf".to_string(),
                description: None,
                steps: normalized,
                triggers: Vec::new(),
                parameters_schema: None,
                default_parameters: serde_json::json!({}),
                output_schema: None,
                dag,
            })
            .await
            .unwrap()
    }

    fn orchestrator(store: Arc<InMemoryStateStore>, jobs: JobHandlerRegistry) -> RunOrchestrator {
        let executor = Arc::new(StepExecutor::new(jobs, Arc::new(crate::EnvServiceResolver)));
        RunOrchestrator::new(store, Arc::new(InlineBus::new()), executor, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn linear_run_succeeds_with_last_step_output() {
        let store = Arc::new(InMemoryStateStore::new());
        let definition = make_definition(&store, vec![job("a", &[], "echo"), job("b", &["a"], "echo"), job("c", &["b"], "echo")]).await;

        let mut jobs = JobHandlerRegistry::new();
        jobs.register("echo", Arc::new(EchoHandler));
        let orch = orchestrator(store.clone(), jobs);

        let run = orch
            .create_run(CreateRunRequest {
                workflow_definition_id: definition.id,
                parameters: serde_json::json!({"x": 1}),
                run_key: None,
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
            })
            .await
            .unwrap();

        let finished = orch.drive(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.output, Some(serde_json::json!({"x": 1})));
        assert!(finished.current_step_id.is_none());

        let steps = store.get_run_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.status == StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn run_key_conflict_surfaces_existing_run() {
        let store = Arc::new(InMemoryStateStore::new());
        let definition = make_definition(&store, vec![job("a", &[], "echo")]).await;
        let mut jobs = JobHandlerRegistry::new();
        jobs.register("echo", Arc::new(EchoHandler));
        let orch = orchestrator(store.clone(), jobs);

        let request = |run_key: Option<&str>| CreateRunRequest {
            workflow_definition_id: definition.id,
            parameters: serde_json::json!({}),
            run_key: run_key.map(str::to_string),
            triggered_by: TriggeredBy::Manual,
            trigger: None,
            partition_key: None,
        };

        orch.create_run(request(Some("daily"))).await.unwrap();
        let conflict = orch.create_run(request(Some("daily"))).await;
        assert!(conflict.is_err());
    }

    #[tokio::test]
    async fn fan_out_clips_to_max_items_and_runs_children_to_completion() {
        let store = Arc::new(InMemoryStateStore::new());
        let fan_out = Step {
            id: "each".to_string(),
            name: "each".to_string(),
            description: None,
            depends_on: Vec::new(),
            retry_policy: None,
            asset_declarations: Vec::new(),
            kind: StepKind::FanOut(FanOutStep {
                collection: r#"[{"i":1},{"i":2},{"i":3},{"i":4}]"#.to_string(),
                template: Box::new(job("child", &[], "echo")),
                max_items: Some(2),
                max_concurrency: Some(1),
                store_results_as: None,
            }),
        };
        let definition = make_definition(&store, vec![fan_out]).await;
        let mut jobs = JobHandlerRegistry::new();
        jobs.register("echo", Arc::new(EchoHandler));
        let orch = orchestrator(store.clone(), jobs);

        let run = orch
            .create_run(CreateRunRequest {
                workflow_definition_id: definition.id,
                parameters: serde_json::json!({}),
                run_key: None,
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
            })
            .await
            .unwrap();

        let finished = orch.drive(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);

        let steps = store.get_run_steps(run.id).await.unwrap();
        let mut children: Vec<_> = steps.iter().filter(|s| s.parent_step_id.is_some()).collect();
        assert_eq!(children.len(), 2, "collection of 4 clipped to maxItems=2");
        assert!(children.iter().all(|s| s.status == StepStatus::Succeeded));

        children.sort_by_key(|s| s.fanout_index);
        assert_eq!(children[0].fanout_index, Some(0));
        assert_eq!(children[1].fanout_index, Some(1));
        // Each child's output is its own collection item (via EchoHandler),
        // not the parent run's parameters — proves fan-out children receive
        // their slice of the collection rather than the run's top-level
        // parameters.
        assert_eq!(children[0].output, Some(serde_json::json!({"i": 1})));
        assert_eq!(children[1].output, Some(serde_json::json!({"i": 2})));
    }

    #[tokio::test]
    async fn retryable_failure_retries_then_succeeds() {
        let store = Arc::new(InMemoryStateStore::new());
        let step = Step {
            retry_policy: Some(RetryPolicy::exponential(3, 1, 1)),
            ..job("a", &[], "flaky")
        };
        let definition = make_definition(&store, vec![step]).await;

        let mut jobs = JobHandlerRegistry::new();
        jobs.register("flaky", Arc::new(FlakyHandler { fail_times: 1, calls: AtomicU32::new(0) }));
        let orch = orchestrator(store.clone(), jobs);

        let run = orch
            .create_run(CreateRunRequest {
                workflow_definition_id: definition.id,
                parameters: serde_json::json!({}),
                run_key: None,
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
            })
            .await
            .unwrap();

        let finished = orch.drive(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);

        let steps = store.get_run_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].attempt, 2);
        assert_eq!(steps[0].retry_count, 1);

        let history = store.list_history_for_run(run.id).await.unwrap();
        let retrying = history.iter().filter(|e| e.event_type == catalog_core::HistoryEventType::StepRetrying).count();
        assert_eq!(retrying, 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_fails_the_run() {
        let store = Arc::new(InMemoryStateStore::new());
        let definition = make_definition(&store, vec![job("a", &[], "missing")]).await;
        let orch = orchestrator(store.clone(), JobHandlerRegistry::new());

        let run = orch
            .create_run(CreateRunRequest {
                workflow_definition_id: definition.id,
                parameters: serde_json::json!({}),
                run_key: None,
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
            })
            .await
            .unwrap();

        let finished = orch.drive(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert!(finished.error_message.is_some());
    }

    #[tokio::test]
    async fn produced_asset_is_recorded_against_its_declaration() {
        let store = Arc::new(InMemoryStateStore::new());
        let step = Step {
            asset_declarations: vec![AssetDeclaration {
                step_id: "a".to_string(),
                direction: AssetDirection::Produces,
                asset_id: AssetId::parse("dataset.orders").unwrap(),
                asset_schema: None,
                freshness: None,
                auto_materialize: None,
                partitioning: None,
            }],
            ..job("a", &[], "producer")
        };
        let definition = make_definition(&store, vec![step]).await;
        let mut jobs = JobHandlerRegistry::new();
        jobs.register("producer", Arc::new(AssetProducingHandler { asset_id: "dataset.orders".to_string() }));
        let orch = orchestrator(store.clone(), jobs);

        let run = orch
            .create_run(CreateRunRequest {
                workflow_definition_id: definition.id,
                parameters: serde_json::json!({}),
                run_key: None,
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
            })
            .await
            .unwrap();

        let finished = orch.drive(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);

        let materialization = store
            .get_latest_materialization(definition.id, &AssetId::parse("dataset.orders").unwrap(), None)
            .await
            .unwrap();
        assert!(materialization.is_some());
    }

    #[tokio::test]
    async fn heartbeat_loss_is_reclaimed_as_a_retryable_failure() {
        // `claimed_at`/`heartbeat_at` are wall-clock (`chrono::Utc::now`)
        // timestamps, not tokio's virtual timer, so staleness here is
        // exercised with a short real heartbeat timeout and a real sleep
        // rather than `tokio::time::pause`. The scripted handler hangs
        // forever, so every `tick()` that dispatches (or re-dispatches) it
        // never returns on its own — each call is backgrounded, and this
        // test observes progress through the store rather than a `tick()`
        // return value.
        let store = Arc::new(InMemoryStateStore::new());
        let step = Step {
            retry_policy: Some(RetryPolicy::exponential(2, 1, 1)),
            ..job("a", &[], "hangs")
        };
        let definition = make_definition(&store, vec![step]).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut jobs = JobHandlerRegistry::new();
        jobs.register("hangs", Arc::new(HangingHandler { started: AsyncMutex::new(Some(tx)) }));
        let executor = Arc::new(StepExecutor::new(jobs, Arc::new(crate::EnvServiceResolver)));
        let config = OrchestratorConfig { run_concurrency: DEFAULT_RUN_CONCURRENCY, heartbeat_timeout_ms: 50 };
        let orch = Arc::new(RunOrchestrator::new(store.clone(), Arc::new(InlineBus::new()), executor, config));

        let run = orch
            .create_run(CreateRunRequest {
                workflow_definition_id: definition.id,
                parameters: serde_json::json!({}),
                run_key: None,
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
            })
            .await
            .unwrap();
        orch.start_run(run.id).await.unwrap();

        let orch_bg = orch.clone();
        let run_id = run.id;
        tokio::spawn(async move {
            let _ = orch_bg.tick(run_id).await;
        });
        rx.await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        // The retry history event is appended early in this tick, before it
        // reaches its own (hanging) redispatch, so it's visible even though
        // this call never returns either.
        let orch_bg2 = orch.clone();
        tokio::spawn(async move {
            let _ = orch_bg2.tick(run_id).await;
        });

        let mut found = false;
        for _ in 0..50 {
            let history = store.list_history_for_run(run.id).await.unwrap();
            if history.iter().any(|e| e.event_type == catalog_core::HistoryEventType::StepRetrying) {
                found = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(found, "expected a step.retrying history event from heartbeat-loss recovery");

        let steps = store.get_run_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].retry_count, 1);
    }

    #[tokio::test]
    async fn cancel_skips_pending_steps() {
        let store = Arc::new(InMemoryStateStore::new());
        let definition = make_definition(&store, vec![job("a", &[], "echo")]).await;
        let mut jobs = JobHandlerRegistry::new();
        jobs.register("echo", Arc::new(EchoHandler));
        let orch = orchestrator(store.clone(), jobs);

        let run = orch
            .create_run(CreateRunRequest {
                workflow_definition_id: definition.id,
                parameters: serde_json::json!({}),
                run_key: None,
                triggered_by: TriggeredBy::Manual,
                trigger: None,
                partition_key: None,
            })
            .await
            .unwrap();

        let canceled = orch.cancel_run(run.id, Some("no longer needed".to_string())).await.unwrap();
        assert_eq!(canceled.status, RunStatus::Canceled);

        let again = orch.tick(run.id).await.unwrap();
        match again {
            TickOutcome::Terminal(run) => assert_eq!(run.status, RunStatus::Canceled),
            TickOutcome::InProgress => panic!("canceled run must stay terminal"),
        }
    }
}
