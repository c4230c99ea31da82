//! Asset ledger operator routes: mark/clear stale, inspect the latest
//! materialization (`spec.md` §4.4).

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use catalog_core::{AssetId, AssetMaterialization, AssetStalePartition};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::require_operator;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/workflows/:definition_id/assets/:asset_id/stale",
            get(list_stale).post(mark_stale).delete(clear_stale),
        )
        .route("/workflows/:definition_id/assets/:asset_id/latest", get(get_latest))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PartitionQuery {
    #[serde(default)]
    pub partition_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkStalePayload {
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

async fn mark_stale(
    State(state): State<AppState>,
    Path((definition_id, asset_id)): Path<(Uuid, String)>,
    headers: HeaderMap,
    Json(payload): Json<MarkStalePayload>,
) -> ApiResult<StatusCode> {
    let operator = require_operator(&headers, &state.config)?;
    let asset_id = AssetId::parse(asset_id)?;
    state
        .assets
        .mark_stale(definition_id, &asset_id, payload.partition_key, operator.token_hash, payload.note)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_stale(
    State(state): State<AppState>,
    Path((definition_id, asset_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<Vec<AssetStalePartition>>> {
    let all = state.store.list_stale(definition_id).await?;
    let filtered = all.into_iter().filter(|s| s.asset_id.as_str() == asset_id).collect();
    Ok(Json(filtered))
}

async fn clear_stale(
    State(state): State<AppState>,
    Path((definition_id, asset_id)): Path<(Uuid, String)>,
    headers: HeaderMap,
    Query(query): Query<PartitionQuery>,
) -> ApiResult<axum::http::StatusCode> {
    require_operator(&headers, &state.config)?;
    let asset_id = AssetId::parse(asset_id)?;
    state.store.clear_stale(definition_id, &asset_id, query.partition_key.as_deref()).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn get_latest(
    State(state): State<AppState>,
    Path((definition_id, asset_id)): Path<(Uuid, String)>,
    Query(query): Query<PartitionQuery>,
) -> ApiResult<Json<Option<AssetMaterialization>>> {
    let asset_id = AssetId::parse(asset_id)?;
    let materialization = state.assets.latest(definition_id, &asset_id, query.partition_key.as_deref()).await?;
    Ok(Json(materialization))
}
