//! Event triggers and their delivery records (`spec.md` §3, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A trigger declared on a workflow definition: either a cron schedule
/// (see [`crate::schedule::Schedule`]) or an event-matching rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerSpec {
    Cron {
        cron: String,
        #[serde(default)]
        timezone: Option<String>,
        #[serde(default)]
        catch_up: bool,
    },
    Event {
        event_type: String,
        #[serde(default)]
        event_source: Option<String>,
        #[serde(default)]
        predicate: Option<serde_json::Value>,
        #[serde(default)]
        throttle_ms: Option<u64>,
    },
}

/// Persisted, resolved event trigger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTrigger {
    pub id: uuid::Uuid,
    pub workflow_definition_id: uuid::Uuid,
    pub event_type: String,
    #[serde(default)]
    pub event_source: Option<String>,
    #[serde(default)]
    pub predicate: Option<serde_json::Value>,
    pub throttle_ms: u64,
    pub failure_threshold: u32,
    pub paused: bool,
    #[serde(default)]
    pub paused_reason: Option<String>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Delivery status of one trigger evaluation against one incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Matched,
    Throttled,
    Skipped,
    Launched,
    Failed,
}

/// One row per (trigger, event) evaluation (`spec.md` §3 `TriggerDelivery`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDelivery {
    pub id: uuid::Uuid,
    pub event_trigger_id: uuid::Uuid,
    pub event_id: uuid::Uuid,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub workflow_run_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
