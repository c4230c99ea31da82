//! Workflow definition routes: publish a new definition version
//! (`spec.md` §3, §4.1). Compilation happens here so a caller never
//! persists a cyclic or malformed graph.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use catalog_core::{TriggerSpec, WorkflowDefinition};
use catalog_dag::validate_and_compile;
use catalog_storage::NewDefinition;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateDefinitionRequest {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<catalog_core::Step>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub parameters_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub default_parameters: serde_json::Value,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", post(create_definition))
        .route("/workflows/:slug", get(get_latest_definition))
        .with_state(state)
}

async fn create_definition(
    State(state): State<AppState>,
    Json(request): Json<CreateDefinitionRequest>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let (steps, dag) = validate_and_compile(request.steps).map_err(catalog_core::EngineError::from)?;

    let definition = state
        .store
        .create_definition(NewDefinition {
            slug: request.slug,
            name: request.name,
            description: request.description,
            steps,
            triggers: request.triggers,
            parameters_schema: request.parameters_schema,
            default_parameters: request.default_parameters,
            output_schema: request.output_schema,
            dag,
        })
        .await?;

    Ok(Json(definition))
}

async fn get_latest_definition(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let definition = state.store.get_latest_definition_by_slug(&slug).await?;
    Ok(Json(definition))
}
