//! Job bundle publish/download routes (`spec.md` §3 `JobBundleVersion`,
//! §6 "signed-URL tokens sign `(slug, version, expiresAt)`").

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use catalog_core::{ArtifactStorage, EngineError, ErrorKind, JobBundleVersion};
use catalog_engine::{verify_checksum, PublishRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::require_operator;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/job-bundles", post(publish_bundle_version))
        .route("/job-bundles/:slug/versions/:version", get(get_bundle_version))
        .route("/job-bundles/:slug/versions/:version/download-token", post(issue_download_token))
        .route("/job-bundles/:slug/versions/:version/download", get(download_bundle_version))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PublishBundlePayload {
    pub slug: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub version: i64,
    pub manifest: serde_json::Value,
    #[serde(default)]
    pub capability_flags: Vec<String>,
    pub artifact_content_type: Option<String>,
    /// Raw artifact bytes, base64-free — callers send the tarball as the
    /// literal request body field for the "local blob" storage path;
    /// external object stores (`artifact_storage: "s3"`) instead supply
    /// `artifact_path` and omit `artifact_data`.
    #[serde(default)]
    pub artifact_data: Option<Vec<u8>>,
    pub artifact_storage: ArtifactStorage,
    pub artifact_path: String,
    #[serde(default)]
    pub force: bool,
}

async fn publish_bundle_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PublishBundlePayload>,
) -> ApiResult<Json<JobBundleVersion>> {
    let operator = require_operator(&headers, &state.config)?;

    let version = state
        .bundles
        .publish(PublishRequest {
            slug: payload.slug,
            display_name: payload.display_name,
            description: payload.description,
            version: payload.version,
            manifest: payload.manifest,
            capability_flags: payload.capability_flags,
            artifact_storage: payload.artifact_storage,
            artifact_path: payload.artifact_path,
            artifact_content_type: payload.artifact_content_type,
            artifact_data: payload.artifact_data,
            published_by: Some(operator.token_hash.clone()),
            published_by_kind: Some("operator_token".to_string()),
            published_by_token_hash: Some(operator.token_hash),
            force: payload.force,
        })
        .await?;

    Ok(Json(version))
}

async fn get_bundle_version(
    State(state): State<AppState>,
    Path((slug, version)): Path<(String, i64)>,
) -> ApiResult<Json<JobBundleVersion>> {
    let version = state.store.get_pinned_bundle_version(&slug, version).await?;
    Ok(Json(version))
}

#[derive(Debug, Serialize)]
struct DownloadToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Issues a time-limited download token signing `(slug, version,
/// expiresAt)` with an HMAC-style digest over a server secret, so the
/// download endpoint can validate possession without a session.
async fn issue_download_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((slug, version)): Path<(String, i64)>,
) -> ApiResult<Json<DownloadToken>> {
    require_operator(&headers, &state.config)?;
    state.store.get_pinned_bundle_version(&slug, version).await?;

    let expires_at = Utc::now() + chrono::Duration::minutes(10);
    let token = sign_download_token(&slug, version, expires_at, &state.config.download_signing_secret);
    Ok(Json(DownloadToken { token, expires_at }))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Validates the signed token and streams the artifact bytes with
/// `Content-Disposition: attachment` (`spec.md` §6). Checksum
/// verification happens before the bytes reach the caller.
async fn download_bundle_version(
    State(state): State<AppState>,
    Path((slug, version)): Path<(String, i64)>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    if Utc::now() > query.expires_at {
        return Err(ApiError(EngineError::new(ErrorKind::Validation, "download token expired")));
    }
    let expected = sign_download_token(&slug, version, query.expires_at, &state.config.download_signing_secret);
    if expected != query.token {
        return Err(ApiError(EngineError::new(ErrorKind::Validation, "invalid download token")));
    }

    let bundle_version = state.store.get_pinned_bundle_version(&slug, version).await?;
    let bytes = bundle_version
        .artifact_data
        .clone()
        .ok_or_else(|| EngineError::new(ErrorKind::Fatal, "artifact bytes unavailable from this process; fetch from the external object store"))?;
    verify_checksum(&bundle_version, &bytes)?;

    let content_type = bundle_version
        .artifact_content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let filename = format!("{slug}-{version}.tgz");

    let mut response = (StatusCode::OK, Bytes::from(bytes)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type).unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")).map_err(|_| {
            ApiError(EngineError::new(ErrorKind::Fatal, "invalid filename for Content-Disposition"))
        })?,
    );
    Ok(response)
}

fn sign_download_token(slug: &str, version: i64, expires_at: DateTime<Utc>, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(slug.as_bytes());
    hasher.update(b"|");
    hasher.update(version.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(expires_at.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
