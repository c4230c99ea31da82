//! Job bundle artifacts (`spec.md` §3 `JobBundleVersion`, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parent record for a published job bundle's versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobBundle {
    pub id: uuid::Uuid,
    pub slug: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub latest_version: Option<i64>,
}

/// Where a bundle artifact's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStorage {
    Local,
    S3,
}

/// Publish/deprecate lifecycle of a bundle version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Published,
    Deprecated,
}

/// A single, immutable (once published) `(slug, version)` addressable
/// artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobBundleVersion {
    pub id: uuid::Uuid,
    pub bundle_id: uuid::Uuid,
    pub slug: String,
    pub version: i64,
    pub manifest: serde_json::Value,
    pub checksum: String,
    #[serde(default)]
    pub capability_flags: Vec<String>,
    pub artifact_storage: ArtifactStorage,
    pub artifact_path: String,
    #[serde(default)]
    pub artifact_content_type: Option<String>,
    #[serde(default)]
    pub artifact_size: Option<i64>,
    /// Inline bytes for `artifact_storage == Local` bundles too small to
    /// warrant a separate blob fetch; `None` when bytes live behind
    /// `artifact_path` in an external object store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_data: Option<Vec<u8>>,
    pub immutable: bool,
    pub status: BundleStatus,
    #[serde(default)]
    pub published_by: Option<String>,
    #[serde(default)]
    pub published_by_kind: Option<String>,
    #[serde(default)]
    pub published_by_token_hash: Option<String>,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub deprecated_at: Option<DateTime<Utc>>,
}

impl JobBundleVersion {
    pub fn is_published(&self) -> bool {
        matches!(self.status, BundleStatus::Published)
    }
}
