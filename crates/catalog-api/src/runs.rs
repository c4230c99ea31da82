//! Run creation/inspection/cancellation routes (`spec.md` §4.2, §6,
//! scenario 4 "run-key conflict", scenario 5 "partitioned workflow
//! requires key").

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use catalog_core::{AssetDirection, RunStatus, TriggeredBy, WorkflowRun, WorkflowRunStep};
use catalog_engine::{validate_partition_key, CreateRunRequest};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRunPayload {
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub run_key: Option<String>,
    #[serde(default)]
    pub partition_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRunPayload {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows/:slug/run", post(create_and_start_run))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/steps", get(get_run_steps))
        .route("/runs/:run_id/cancel", patch(cancel_run))
        .with_state(state)
}

/// `POST /workflows/:slug/run` — creates a `pending` run against the
/// latest published version of `slug`. Claiming the run and driving it to
/// completion is the orchestrator worker loop's job (`catalog-worker`),
/// not this handler's — a caller polls `GET /runs/:id` (or subscribes to
/// the event bus) for progress: an external submitter creates a run
/// record, and the orchestrator worker loop is what claims and drives it.
async fn create_and_start_run(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(payload): Json<CreateRunPayload>,
) -> ApiResult<Json<WorkflowRun>> {
    let definition = state.store.get_latest_definition_by_slug(&slug).await?;

    let partition_key = validate_run_partition_key(&definition, payload.partition_key.as_deref())?;

    let run = state
        .orchestrator
        .create_run(CreateRunRequest {
            workflow_definition_id: definition.id,
            parameters: payload.parameters,
            run_key: payload.run_key,
            triggered_by: TriggeredBy::Manual,
            trigger: None,
            partition_key,
        })
        .await?;

    Ok(Json(run))
}

/// A workflow is "partitioned" if any step declares a `produces` asset
/// with a partitioning scheme; run-create gates such workflows on a
/// `partitionKey` matching that scheme (`spec.md` §4.4, §4.8, scenario 5).
fn validate_run_partition_key(
    definition: &catalog_core::WorkflowDefinition,
    partition_key: Option<&str>,
) -> Result<Option<String>, catalog_core::EngineError> {
    let partitioning = definition.steps.iter().find_map(|step| {
        step.asset_declarations
            .iter()
            .find(|decl| decl.direction == AssetDirection::Produces && decl.partitioning.is_some())
            .and_then(|decl| decl.partitioning.as_ref())
    });
    validate_partition_key(partitioning, partition_key)
}

async fn get_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> ApiResult<Json<WorkflowRun>> {
    let run = state.store.get_run(run_id).await?;
    Ok(Json(run))
}

async fn get_run_steps(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkflowRunStep>>> {
    let steps = state.store.get_run_steps(run_id).await?;
    Ok(Json(steps))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(payload): Json<CancelRunPayload>,
) -> ApiResult<Json<WorkflowRun>> {
    let run = state.orchestrator.cancel_run(run_id, payload.reason).await?;
    debug_assert!(run.status == RunStatus::Canceled || run.is_terminal());
    Ok(Json(run))
}
