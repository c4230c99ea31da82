//! Append-only execution history (`spec.md` §3, §4.9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle transition kinds recorded in `workflow_execution_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    RunCreated,
    RunStarted,
    RunCompleted,
    StepStarted,
    StepHeartbeat,
    StepCompleted,
    StepFailed,
    StepRetrying,
    StepSkipped,
    FanoutExpanded,
    AssetMaterialized,
    AssetStaleMarked,
    AssetStaleCleared,
}

/// One append-only row. Never updated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHistoryEvent {
    pub id: uuid::Uuid,
    pub workflow_run_id: uuid::Uuid,
    #[serde(default)]
    pub workflow_run_step_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub step_id: Option<String>,
    pub event_type: HistoryEventType,
    pub event_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
