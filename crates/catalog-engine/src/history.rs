//! Execution history recording (`spec.md` §4.9).
//!
//! Thin wrapper around `StateStore::append_history_event` that builds the
//! `ExecutionHistoryEvent` rows the orchestrator and executor emit at each
//! lifecycle transition, so callers construct events by intent
//! (`step_started`, `run_completed`, ...) rather than by hand.

use std::sync::Arc;

use catalog_core::{EngineError, ExecutionHistoryEvent, HistoryEventType};
use catalog_storage::StateStore;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn StateStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        workflow_run_id: Uuid,
        workflow_run_step_id: Option<Uuid>,
        step_id: Option<String>,
        event_type: HistoryEventType,
        payload: Value,
    ) -> Result<(), EngineError> {
        let event = ExecutionHistoryEvent {
            id: Uuid::now_v7(),
            workflow_run_id,
            workflow_run_step_id,
            step_id,
            event_type,
            event_payload: payload,
            created_at: Utc::now(),
        };
        self.store.append_history_event(event).await
    }

    pub async fn run_created(&self, run_id: Uuid, payload: Value) -> Result<(), EngineError> {
        self.record(run_id, None, None, HistoryEventType::RunCreated, payload).await
    }

    pub async fn run_started(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.record(run_id, None, None, HistoryEventType::RunStarted, Value::Null).await
    }

    pub async fn run_completed(&self, run_id: Uuid, payload: Value) -> Result<(), EngineError> {
        self.record(run_id, None, None, HistoryEventType::RunCompleted, payload).await
    }

    pub async fn step_started(
        &self,
        run_id: Uuid,
        step_row_id: Uuid,
        step_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.record(run_id, Some(step_row_id), Some(step_id.to_string()), HistoryEventType::StepStarted, payload)
            .await
    }

    pub async fn step_heartbeat(&self, run_id: Uuid, step_row_id: Uuid, step_id: &str) -> Result<(), EngineError> {
        self.record(
            run_id,
            Some(step_row_id),
            Some(step_id.to_string()),
            HistoryEventType::StepHeartbeat,
            Value::Null,
        )
        .await
    }

    pub async fn step_completed(
        &self,
        run_id: Uuid,
        step_row_id: Uuid,
        step_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.record(run_id, Some(step_row_id), Some(step_id.to_string()), HistoryEventType::StepCompleted, payload)
            .await
    }

    pub async fn step_failed(
        &self,
        run_id: Uuid,
        step_row_id: Uuid,
        step_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.record(run_id, Some(step_row_id), Some(step_id.to_string()), HistoryEventType::StepFailed, payload)
            .await
    }

    pub async fn step_retrying(
        &self,
        run_id: Uuid,
        step_row_id: Uuid,
        step_id: &str,
        attempt: u32,
    ) -> Result<(), EngineError> {
        self.record(
            run_id,
            Some(step_row_id),
            Some(step_id.to_string()),
            HistoryEventType::StepRetrying,
            serde_json::json!({"attempt": attempt}),
        )
        .await
    }

    pub async fn step_skipped(&self, run_id: Uuid, step_id: &str, reason: &str) -> Result<(), EngineError> {
        self.record(
            run_id,
            None,
            Some(step_id.to_string()),
            HistoryEventType::StepSkipped,
            serde_json::json!({"reason": reason}),
        )
        .await
    }

    pub async fn fanout_expanded(&self, run_id: Uuid, step_id: &str, child_count: usize) -> Result<(), EngineError> {
        self.record(
            run_id,
            None,
            Some(step_id.to_string()),
            HistoryEventType::FanoutExpanded,
            serde_json::json!({"childCount": child_count}),
        )
        .await
    }

    pub async fn asset_materialized(&self, run_id: Uuid, step_id: &str, asset_id: &str) -> Result<(), EngineError> {
        self.record(
            run_id,
            None,
            Some(step_id.to_string()),
            HistoryEventType::AssetMaterialized,
            serde_json::json!({"assetId": asset_id}),
        )
        .await
    }

    pub async fn asset_stale_marked(&self, run_id: Uuid, asset_id: &str, partition_key: Option<&str>) -> Result<(), EngineError> {
        self.record(
            run_id,
            None,
            None,
            HistoryEventType::AssetStaleMarked,
            serde_json::json!({"assetId": asset_id, "partitionKey": partition_key}),
        )
        .await
    }

    pub async fn asset_stale_cleared(&self, run_id: Uuid, asset_id: &str, partition_key: Option<&str>) -> Result<(), EngineError> {
        self.record(
            run_id,
            None,
            None,
            HistoryEventType::AssetStaleCleared,
            serde_json::json!({"assetId": asset_id, "partitionKey": partition_key}),
        )
        .await
    }
}
