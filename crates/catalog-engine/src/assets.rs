//! Asset ledger: materialization recording, staleness, and auto-materialize
//! policy evaluation (`spec.md` §4.4).

use std::sync::Arc;

use catalog_core::{
    AssetDeclaration, AssetId, AssetMaterialization, AssetStalePartition, AutoMaterializePolicy, EngineError,
    FreshnessPolicy,
};
use catalog_storage::StateStore;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use uuid::Uuid;

use crate::partition;

pub struct AssetLedger {
    store: Arc<dyn StateStore>,
}

/// Everything needed to record one materialization row, independent of how
/// the caller (job step, service step, or fan-out child) produced it.
pub struct MaterializationInput {
    pub workflow_definition_id: Uuid,
    pub workflow_run_id: Uuid,
    pub workflow_run_step_id: Uuid,
    pub step_id: String,
    pub declaration: AssetDeclaration,
    pub partition_key: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl AssetLedger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Validates the caller-supplied partition key against the
    /// declaration's partitioning scheme, inserts the materialization row,
    /// and clears any stale marker for the (definition, asset, partition)
    /// tuple, mirroring `spec.md`'s `recordMaterialization` contract.
    pub async fn record(&self, input: MaterializationInput) -> Result<AssetMaterialization, EngineError> {
        let validated_key =
            partition::validate_partition_key(input.declaration.partitioning.as_ref(), input.partition_key.as_deref())?;

        let now = Utc::now();
        let materialization = AssetMaterialization {
            id: Uuid::now_v7(),
            workflow_definition_id: input.workflow_definition_id,
            workflow_run_id: input.workflow_run_id,
            workflow_run_step_id: input.workflow_run_step_id,
            step_id: input.step_id,
            asset_id: input.declaration.asset_id.clone(),
            partition_key: validated_key.clone(),
            payload: input.payload,
            asset_schema: input.declaration.asset_schema.clone(),
            freshness: input.declaration.freshness.clone(),
            produced_at: now,
            updated_at: now,
            created_at: now,
        };

        self.store.record_materialization(materialization.clone()).await?;
        self.store
            .clear_stale(input.workflow_definition_id, &materialization.asset_id, validated_key.as_deref())
            .await?;

        Ok(materialization)
    }

    pub async fn latest(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<Option<AssetMaterialization>, EngineError> {
        self.store.get_latest_materialization(workflow_definition_id, asset_id, partition_key).await
    }

    pub async fn mark_stale(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<String>,
        requested_by: String,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        self.store
            .mark_stale(AssetStalePartition {
                workflow_definition_id,
                asset_id: asset_id.clone(),
                partition_key,
                requested_by,
                requested_at: Utc::now(),
                note,
            })
            .await
    }

    pub async fn list_stale(&self, workflow_definition_id: Uuid) -> Result<Vec<AssetStalePartition>, EngineError> {
        self.store.list_stale(workflow_definition_id).await
    }
}

/// `true` if a materialization is out of date relative to `freshness` as of
/// `now`. A missing materialization is always stale. `maxAgeMs` and
/// `cronRule` are independent checks; either firing marks the asset stale.
pub fn is_stale(materialization: Option<&AssetMaterialization>, freshness: Option<&FreshnessPolicy>, now: DateTime<Utc>) -> bool {
    let Some(materialization) = materialization else {
        return true;
    };
    let Some(policy) = freshness else {
        return false;
    };

    if let Some(max_age_ms) = policy.max_age_ms {
        let age_ms = (now - materialization.produced_at).num_milliseconds().max(0) as u64;
        if age_ms > max_age_ms {
            return true;
        }
    }

    if let Some(cron_rule) = &policy.cron_rule {
        if let Ok(schedule) = cron::Schedule::from_str(cron_rule) {
            if let Some(next_due) = schedule.after(&materialization.produced_at).next() {
                if next_due <= now {
                    return true;
                }
            }
        }
    }

    false
}

/// `true` if an asset declaring `policy` should be auto-materialized now,
/// given the latest materialization (as the cooldown anchor) and freshness.
pub fn should_auto_materialize(
    policy: &AutoMaterializePolicy,
    materialization: Option<&AssetMaterialization>,
    freshness: Option<&FreshnessPolicy>,
    now: DateTime<Utc>,
) -> bool {
    if !policy.enabled {
        return false;
    }
    if !is_stale(materialization, freshness, now) {
        return false;
    }
    if let (Some(cooldown_ms), Some(materialization)) = (policy.cooldown_ms, materialization) {
        let since_last_ms = (now - materialization.produced_at).num_milliseconds().max(0) as u64;
        if since_last_ms < cooldown_ms {
            return false;
        }
    }
    true
}

/// Backoff applied after a failed auto-materialize run, doubling per
/// consecutive failure up to a day, so a broken asset doesn't re-fire every
/// evaluator poll.
pub fn next_cooldown_backoff(consecutive_failures: u32) -> chrono::Duration {
    let capped = consecutive_failures.min(10);
    let minutes = 5u64.saturating_mul(1u64 << capped).min(24 * 60);
    chrono::Duration::minutes(minutes as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::AssetId;
    use chrono::Duration;

    fn materialization_at(produced_at: DateTime<Utc>) -> AssetMaterialization {
        AssetMaterialization {
            id: Uuid::now_v7(),
            workflow_definition_id: Uuid::now_v7(),
            workflow_run_id: Uuid::now_v7(),
            workflow_run_step_id: Uuid::now_v7(),
            step_id: "build".to_string(),
            asset_id: AssetId::parse("sales.daily").unwrap(),
            partition_key: None,
            payload: None,
            asset_schema: None,
            freshness: None,
            produced_at,
            updated_at: produced_at,
            created_at: produced_at,
        }
    }

    #[test]
    fn missing_materialization_is_always_stale() {
        assert!(is_stale(None, None, Utc::now()));
    }

    #[test]
    fn max_age_marks_stale_once_exceeded() {
        let now = Utc::now();
        let policy = FreshnessPolicy {
            max_age_ms: Some(60_000),
            cron_rule: None,
        };
        let fresh = materialization_at(now - Duration::seconds(10));
        let stale = materialization_at(now - Duration::seconds(120));
        assert!(!is_stale(Some(&fresh), Some(&policy), now));
        assert!(is_stale(Some(&stale), Some(&policy), now));
    }

    #[test]
    fn no_freshness_policy_is_never_stale() {
        let now = Utc::now();
        let materialization = materialization_at(now - Duration::days(30));
        assert!(!is_stale(Some(&materialization), None, now));
    }

    #[test]
    fn cooldown_suppresses_repeated_auto_materialize() {
        let now = Utc::now();
        let policy = AutoMaterializePolicy {
            enabled: true,
            cooldown_ms: Some(3_600_000),
        };
        let freshness = FreshnessPolicy {
            max_age_ms: Some(1),
            cron_rule: None,
        };
        let recent = materialization_at(now - Duration::minutes(5));
        assert!(!should_auto_materialize(&policy, Some(&recent), Some(&freshness), now));

        let old = materialization_at(now - Duration::hours(2));
        assert!(should_auto_materialize(&policy, Some(&old), Some(&freshness), now));
    }

    #[test]
    fn disabled_policy_never_auto_materializes() {
        let policy = AutoMaterializePolicy {
            enabled: false,
            cooldown_ms: None,
        };
        assert!(!should_auto_materialize(&policy, None, None, Utc::now()));
    }

    #[test]
    fn cooldown_backoff_doubles_and_caps_at_a_day() {
        assert_eq!(next_cooldown_backoff(0), Duration::minutes(5));
        assert_eq!(next_cooldown_backoff(1), Duration::minutes(10));
        assert_eq!(next_cooldown_backoff(2), Duration::minutes(20));
        assert_eq!(next_cooldown_backoff(20), Duration::minutes(24 * 60));
    }
}
