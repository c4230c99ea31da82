//! Job bundle publish/resolve orchestration (`spec.md` §3, §6).
//!
//! `StateStore::publish_bundle_version` rejects a non-force publish against
//! an existing `(slug, version)` as a `Conflict`; this module owns the
//! `force=true` replace semantics (delete then insert) and the checksum /
//! size gating the HTTP layer relies on before a version ever reaches the
//! store.

use std::sync::Arc;

use catalog_core::{ArtifactStorage, BundleBinding, BundleStatus, BundleStrategy, EngineError, ErrorKind, JobBundleVersion};
use catalog_storage::StateStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const DEFAULT_MAX_BUNDLE_SIZE: u64 = 16 * 1024 * 1024;

fn max_bundle_size() -> u64 {
    std::env::var("APPHUB_JOB_BUNDLE_MAX_SIZE")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_MAX_BUNDLE_SIZE)
}

/// Input to a publish request; `force` replaces an existing `(slug,
/// version)` row instead of conflicting.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub slug: String,
    pub display_name: String,
    pub description: Option<String>,
    pub version: i64,
    pub manifest: serde_json::Value,
    pub capability_flags: Vec<String>,
    pub artifact_storage: ArtifactStorage,
    pub artifact_path: String,
    pub artifact_content_type: Option<String>,
    pub artifact_data: Option<Vec<u8>>,
    pub published_by: Option<String>,
    pub published_by_kind: Option<String>,
    pub published_by_token_hash: Option<String>,
    pub force: bool,
}

pub struct BundlePublisher {
    store: Arc<dyn StateStore>,
}

impl BundlePublisher {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<JobBundleVersion, EngineError> {
        if let Some(data) = &request.artifact_data {
            let max = max_bundle_size();
            if data.len() as u64 > max {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!("bundle artifact exceeds the maximum size of {max} bytes"),
                ));
            }
        }

        self.store
            .upsert_bundle(&request.slug, &request.display_name, request.description.as_deref())
            .await?;

        if request.force {
            self.store.delete_bundle_version(&request.slug, request.version).await?;
        }

        let checksum = match &request.artifact_data {
            Some(data) => hex::encode(Sha256::digest(data)),
            None => {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    "artifact checksum requires inline artifact bytes for local verification",
                ))
            }
        };

        let version = JobBundleVersion {
            id: Uuid::now_v7(),
            bundle_id: self.store.get_bundle(&request.slug).await?.id,
            slug: request.slug,
            version: request.version,
            manifest: request.manifest,
            checksum,
            capability_flags: request.capability_flags,
            artifact_storage: request.artifact_storage,
            artifact_path: request.artifact_path,
            artifact_content_type: request.artifact_content_type,
            artifact_size: request.artifact_data.as_ref().map(|data| data.len() as i64),
            artifact_data: request.artifact_data,
            immutable: true,
            status: BundleStatus::Published,
            published_by: request.published_by,
            published_by_kind: request.published_by_kind,
            published_by_token_hash: request.published_by_token_hash,
            published_at: Utc::now(),
            deprecated_at: None,
        };

        self.store.publish_bundle_version(version).await
    }

    /// Resolves a job step's bundle binding to a concrete version. `latest`
    /// resolution happens at run-creation time (`spec.md` §4.1, Design Note):
    /// the binding is re-resolved against the job registry's current highest
    /// published version on every run, not fixed at definition time.
    pub async fn resolve(&self, binding: &BundleBinding) -> Result<JobBundleVersion, EngineError> {
        match binding.strategy {
            BundleStrategy::Latest => self.store.get_latest_published_bundle_version(&binding.slug).await,
            BundleStrategy::Pinned => {
                let version = binding.version.ok_or_else(|| {
                    EngineError::new(ErrorKind::Validation, "pinned bundle binding requires a version")
                })?;
                self.store.get_pinned_bundle_version(&binding.slug, version).await
            }
        }
    }
}

/// Verifies a downloaded artifact's bytes against the version's recorded
/// checksum; used by the download endpoint after streaming from the
/// artifact store.
pub fn verify_checksum(version: &JobBundleVersion, bytes: &[u8]) -> Result<(), EngineError> {
    let actual = hex::encode(Sha256::digest(bytes));
    if actual == version.checksum {
        Ok(())
    } else {
        Err(EngineError::new(
            ErrorKind::Validation,
            format!("artifact checksum mismatch for {}@{}", version.slug, version.version),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_storage::InMemoryStateStore;

    fn sample_request(version: i64, force: bool) -> PublishRequest {
        PublishRequest {
            slug: "transform-csv".to_string(),
            display_name: "Transform CSV".to_string(),
            description: None,
            version,
            manifest: serde_json::json!({"entryPoint": "index.js"}),
            capability_flags: vec![],
            artifact_storage: ArtifactStorage::Local,
            artifact_path: "bundles/transform-csv/1.tgz".to_string(),
            artifact_content_type: Some("application/gzip".to_string()),
            artifact_data: Some(b"fake tarball bytes".to_vec()),
            published_by: Some("operator@example.com".to_string()),
            published_by_kind: Some("user".to_string()),
            published_by_token_hash: None,
            force,
        }
    }

    #[tokio::test]
    async fn publish_then_conflicting_publish_without_force_fails() {
        let store = Arc::new(InMemoryStateStore::new());
        let publisher = BundlePublisher::new(store.clone());

        publisher.publish(sample_request(1, false)).await.unwrap();
        let result = publisher.publish(sample_request(1, false)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn forced_publish_replaces_existing_version() {
        let store = Arc::new(InMemoryStateStore::new());
        let publisher = BundlePublisher::new(store.clone());

        let first = publisher.publish(sample_request(1, false)).await.unwrap();
        let second = publisher.publish(sample_request(1, true)).await.unwrap();
        assert_eq!(first.version, second.version);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn oversized_artifact_is_rejected() {
        std::env::set_var("APPHUB_JOB_BUNDLE_MAX_SIZE", "8");
        let store = Arc::new(InMemoryStateStore::new());
        let publisher = BundlePublisher::new(store);
        let result = publisher.publish(sample_request(1, false)).await;
        std::env::remove_var("APPHUB_JOB_BUNDLE_MAX_SIZE");
        assert!(result.is_err());
    }
}
