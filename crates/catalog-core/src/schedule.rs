//! Cron schedules (`spec.md` §3 `Schedule`, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One materialized catch-up window, recorded so the dispatcher can tell
/// which windows have already produced a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedWindow {
    pub window_start: DateTime<Utc>,
}

/// Persisted cron schedule attached to a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: uuid::Uuid,
    pub workflow_definition_id: uuid::Uuid,
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub start_window: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_window: Option<DateTime<Utc>>,
    pub catch_up: bool,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_materialized_window: Option<MaterializedWindow>,
    #[serde(default)]
    pub catchup_cursor: Option<DateTime<Utc>>,
}
