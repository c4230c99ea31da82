//! Event taxonomy and wire envelope (`spec.md` §4.7, §6).
//!
//! This module only defines the data shape. Transport (in-process fan-out,
//! Redis mirroring, loopback suppression) lives in `catalog-events`, which
//! depends on this crate rather than the other way around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The subset of the event taxonomy most relevant to the core engine
/// (`spec.md` §4.7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowDefinitionUpdated,
    WorkflowRunUpdated,
    WorkflowRunPending,
    WorkflowRunRunning,
    WorkflowRunSucceeded,
    WorkflowRunFailed,
    WorkflowRunCanceled,
    WorkflowEventReceived,
    JobRunUpdated,
    JobRunPending,
    JobRunRunning,
    JobRunSucceeded,
    JobRunFailed,
    JobRunCanceled,
    JobRunExpired,
    JobBundlePublished,
    JobBundleUpdated,
    JobBundleDeprecated,
    AssetProduced,
    AssetExpired,
    WorkflowAnalyticsSnapshot,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowDefinitionUpdated => "workflow.definition.updated",
            EventType::WorkflowRunUpdated => "workflow.run.updated",
            EventType::WorkflowRunPending => "workflow.run.pending",
            EventType::WorkflowRunRunning => "workflow.run.running",
            EventType::WorkflowRunSucceeded => "workflow.run.succeeded",
            EventType::WorkflowRunFailed => "workflow.run.failed",
            EventType::WorkflowRunCanceled => "workflow.run.canceled",
            EventType::WorkflowEventReceived => "workflow.event.received",
            EventType::JobRunUpdated => "job.run.updated",
            EventType::JobRunPending => "job.run.pending",
            EventType::JobRunRunning => "job.run.running",
            EventType::JobRunSucceeded => "job.run.succeeded",
            EventType::JobRunFailed => "job.run.failed",
            EventType::JobRunCanceled => "job.run.canceled",
            EventType::JobRunExpired => "job.run.expired",
            EventType::JobBundlePublished => "job.bundle.published",
            EventType::JobBundleUpdated => "job.bundle.updated",
            EventType::JobBundleDeprecated => "job.bundle.deprecated",
            EventType::AssetProduced => "asset.produced",
            EventType::AssetExpired => "asset.expired",
            EventType::WorkflowAnalyticsSnapshot => "workflow.analytics.snapshot",
        }
    }
}

/// `__apphubWorkflow` metadata key (`spec.md` §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApphubWorkflowMeta {
    #[serde(default)]
    pub workflow_definition_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub workflow_run_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub workflow_run_step_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub job_run_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub job_slug: Option<String>,
}

/// Wire envelope for every emitted event (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: uuid::Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(rename = "__apphubWorkflow", default)]
    pub apphub_workflow: Option<ApphubWorkflowMeta>,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            event_type: event_type.as_str().to_string(),
            source: source.into(),
            occurred_at: Utc::now(),
            payload,
            correlation_id: None,
            ttl: None,
            metadata: None,
        }
    }

    pub fn with_workflow_meta(mut self, meta: ApphubWorkflowMeta) -> Self {
        self.metadata = Some(EventMetadata {
            apphub_workflow: Some(meta),
        });
        self
    }
}
