//! Asset declarations, partitioning, and materialization records (`spec.md` §3, §4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Validated asset identifier: `[A-Za-z0-9][A-Za-z0-9._:-]*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let valid = match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() => chars
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')),
            _ => false,
        };
        if !valid {
            return Err(EngineError::validation(format!(
                "invalid asset id: {raw}"
            ))
            .with_detail(serde_json::json!({"assetId": raw})));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a step produces or consumes the declared asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetDirection {
    Produces,
    Consumes,
}

/// Time-window bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Default `lookbackWindows` per `spec.md` §4.4.
    pub fn default_lookback_windows(self) -> u32 {
        match self {
            Granularity::Hour => 24,
            Granularity::Day => 14,
            Granularity::Week => 8,
            Granularity::Month => 12,
        }
    }
}

/// Partitioning scheme for an asset (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Partitioning {
    Static {
        keys: Vec<String>,
    },
    TimeWindow {
        granularity: Granularity,
        #[serde(default)]
        timezone: Option<String>,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        lookback_windows: Option<u32>,
    },
    Dynamic {
        #[serde(default)]
        max_keys: Option<u32>,
        #[serde(default)]
        retention_days: Option<u32>,
    },
}

impl Partitioning {
    pub fn lookback_windows(&self) -> Option<u32> {
        match self {
            Partitioning::TimeWindow {
                granularity,
                lookback_windows,
                ..
            } => Some(lookback_windows.unwrap_or(granularity.default_lookback_windows())),
            _ => None,
        }
    }
}

/// Freshness policy: how stale may a materialization be before it is
/// considered out of date by auto-materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessPolicy {
    #[serde(default)]
    pub max_age_ms: Option<u64>,
    #[serde(default)]
    pub cron_rule: Option<String>,
}

/// Auto-materialize policy attached to an asset declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMaterializePolicy {
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
}

impl Default for AutoMaterializePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown_ms: None,
        }
    }
}

/// One `produces`/`consumes` declaration on a step (`spec.md` §3, §6
/// `workflow_asset_declarations`). Uniqueness:
/// `(workflowDefId, stepId, direction, assetId)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDeclaration {
    pub step_id: String,
    pub direction: AssetDirection,
    pub asset_id: AssetId,
    #[serde(default)]
    pub asset_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub freshness: Option<FreshnessPolicy>,
    #[serde(default)]
    pub auto_materialize: Option<AutoMaterializePolicy>,
    #[serde(default)]
    pub partitioning: Option<Partitioning>,
}

/// Source of a partition-key parameter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionParamSource {
    Manual,
    System,
}

/// Row recorded for `workflow_run_step_assets` (`spec.md` §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMaterialization {
    pub id: uuid::Uuid,
    pub workflow_definition_id: uuid::Uuid,
    pub workflow_run_id: uuid::Uuid,
    pub workflow_run_step_id: uuid::Uuid,
    pub step_id: String,
    pub asset_id: AssetId,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub asset_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub freshness: Option<FreshnessPolicy>,
    pub produced_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Operator or policy-set staleness marker (`spec.md` §3 `AssetStalePartition`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStalePartition {
    pub workflow_definition_id: uuid::Uuid,
    pub asset_id: AssetId,
    #[serde(default)]
    pub partition_key: Option<String>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Per-partition parameter snapshot (`spec.md` §3 `AssetPartitionParameters`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPartitionParameters {
    pub workflow_definition_id: uuid::Uuid,
    pub asset_id: AssetId,
    pub partition_key: String,
    pub parameters: serde_json::Value,
    pub source: PartitionParamSource,
}

/// One `workflowAutoRunClaim` row (`spec.md` §4.2, §4.5): the auto-materialize
/// evaluator's bookkeeping for a single `(workflowDefinitionId, assetId,
/// partitionKey)` triple, keyed so at most one in-flight run is ever created
/// per partition and repeated failures back off instead of re-firing every
/// poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRunClaim {
    pub id: uuid::Uuid,
    pub workflow_definition_id: uuid::Uuid,
    pub asset_id: AssetId,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub workflow_run_id: Option<uuid::Uuid>,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_id_accepts_valid_pattern() {
        assert!(AssetId::parse("sales").is_ok());
        assert!(AssetId::parse("sales.v2:daily-report_1").is_ok());
    }

    #[test]
    fn asset_id_rejects_leading_symbol_and_empty() {
        assert!(AssetId::parse("").is_err());
        assert!(AssetId::parse("-sales").is_err());
        assert!(AssetId::parse("_sales").is_err());
        assert!(AssetId::parse("sales space").is_err());
    }

    #[test]
    fn granularity_default_lookback_matches_spec() {
        assert_eq!(Granularity::Hour.default_lookback_windows(), 24);
        assert_eq!(Granularity::Day.default_lookback_windows(), 14);
        assert_eq!(Granularity::Week.default_lookback_windows(), 8);
        assert_eq!(Granularity::Month.default_lookback_windows(), 12);
    }
}
