//! Engine-wide error taxonomy
//!
//! Every crate in the workspace maps its failures onto [`ErrorKind`] so that
//! retry policy and HTTP status mapping can live in one place instead of
//! being re-derived per crate.

use serde::{Deserialize, Serialize};

/// Coarse error classification shared by the DAG compiler, the orchestrator,
/// the storage adapter, and the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Definition or payload failed schema/DAG checks. Not retried.
    Validation,
    /// Duplicate slug/version, run-key conflict, duplicate bundle publish.
    Conflict,
    /// Unknown definition/run/step/bundle.
    NotFound,
    /// Connection resets, broker unavailable, 5xx from services. Retried per policy.
    Transient,
    /// Step heartbeat timeout. Retried if retry budget remains.
    HeartbeatLost,
    /// Cooperative cancellation.
    Canceled,
    /// Invariant violation. Halts the run; surfaced to the audit log.
    Fatal,
}

impl ErrorKind {
    /// Whether an error of this kind should be retried under the step's
    /// retry policy (§7: "TRANSIENT and HEARTBEAT_LOST are retried with
    /// exponential backoff until maxAttempts; everything else terminates
    /// the step").
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::HeartbeatLost)
    }
}

/// Engine-wide error type.
///
/// `detail` carries machine-readable context (e.g. the conflicting run id)
/// that the HTTP layer surfaces verbatim in the `{error: {kind, message,
/// detail?}}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_heartbeat_lost_are_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::HeartbeatLost.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
        assert!(!ErrorKind::Canceled.is_retryable());
    }

    #[test]
    fn engine_error_carries_detail() {
        let err = EngineError::conflict("run-key conflict")
            .with_detail(serde_json::json!({"existingRunId": "abc"}));
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.detail.unwrap()["existingRunId"], "abc");
    }
}
