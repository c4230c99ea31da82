//! Run-time execution state: `WorkflowRun`, `WorkflowRunStep`, `JobRun` (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asset::AssetId;

/// Lifecycle status of a `WorkflowRun`.
///
/// ```text
/// pending --start--> running --all-done--> succeeded
///                        |
///                        +--fatal-step--> failed
///                        +--cancel------> canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

/// Who/what created a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Schedule,
    Event,
    Auto,
}

/// A snapshot of the trigger state at run-creation time, stored alongside
/// the run for audit/debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSnapshot {
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub schedule_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub event_trigger_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub source_event_id: Option<uuid::Uuid>,
    /// The asset declaration that made this run's creation due, set only
    /// when `triggeredBy == Auto`.
    #[serde(default)]
    pub asset_id: Option<AssetId>,
}

/// One execution of a `WorkflowDefinition` with concrete parameters and an
/// optional partition key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: uuid::Uuid,
    pub workflow_definition_id: uuid::Uuid,
    pub status: RunStatus,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub current_step_index: Option<i32>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub trigger: Option<TriggerSnapshot>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub run_key: Option<String>,
    #[serde(default)]
    pub run_key_normalized: Option<String>,
    #[serde(default)]
    pub claim_owner: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Lifecycle status of a `WorkflowRunStep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Failure category recorded on a terminal-failed step (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Validation,
    Timeout,
    HeartbeatLost,
    HandlerError,
    UpstreamUnavailable,
    Canceled,
    Unknown,
}

/// One materialized node of a run's execution graph: a plain step, or a
/// fan-out child (`parentStepId`/`fanoutIndex`/`templateStepId` set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStep {
    pub id: uuid::Uuid,
    pub workflow_run_id: uuid::Uuid,
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub retry_count: u32,
    /// Set while `status == Running`; identifies the orchestrator/worker
    /// instance holding the claim so a crash can be detected and the claim
    /// released (`spec.md` §4.2 crash recovery).
    #[serde(default)]
    pub claim_owner: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub job_run_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_step_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub fanout_index: Option<i32>,
    #[serde(default)]
    pub template_step_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRunStep {
    /// The idempotency key passed to job bundle handlers (`spec.md` §4.3):
    /// `attemptToken = hash(runId, stepId, attempt)`.
    pub fn attempt_token(&self) -> String {
        use sha2_fallback::hash_hex;
        hash_hex(&format!(
            "{}:{}:{}",
            self.workflow_run_id, self.step_id, self.attempt
        ))
    }
}

/// Lifecycle status of a `JobRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Expired,
}

/// One attempt of an externally supplied job bundle handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: uuid::Uuid,
    pub job_definition_id: uuid::Uuid,
    pub status: JobRunStatus,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    #[serde(default)]
    pub context: serde_json::Value,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
}

/// Small dependency-free hex digest used for attempt tokens. Kept as a
/// module instead of pulling `sha2` into the I/O-free core crate's public
/// surface for a single helper; engine code that needs a real digest for
/// artifact checksums uses `sha2` directly (see `catalog-engine`).
mod sha2_fallback {
    pub fn hash_hex(input: &str) -> String {
        // FNV-1a 64-bit: deterministic, dependency-free, sufficient for an
        // idempotency key (not a security boundary).
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;
        let mut hash = FNV_OFFSET;
        for byte in input.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        format!("{hash:016x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminal_states() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn attempt_token_is_deterministic_per_attempt() {
        let run_id = uuid::Uuid::now_v7();
        let mut step = WorkflowRunStep {
            id: uuid::Uuid::now_v7(),
            workflow_run_id: run_id,
            step_id: "a".into(),
            status: StepStatus::Running,
            attempt: 1,
            max_attempts: 3,
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let token1 = step.attempt_token();
        let token1_again = step.attempt_token();
        assert_eq!(token1, token1_again);
        step.attempt = 2;
        let token2 = step.attempt_token();
        assert_ne!(token1, token2);
    }
}
