//! Operator bearer-token gate for publish/stale-marking endpoints.
//!
//! Full OIDC/session auth and API-key management are out of scope; this
//! crate only needs to tell "some configured operator" from "anonymous
//! caller" for the handful of mutating endpoints this surface exposes,
//! mirroring the bearer-extraction shape of a control-plane auth
//! middleware without its session/JWT machinery.

use axum::http::HeaderMap;
use catalog_core::{EngineError, ErrorKind};
use sha2::{Digest, Sha256};

use crate::config::Config;

/// An authenticated operator identity: the sha256 of the presented
/// bearer token, stored on `AuditLogEntry`/`published_by_token_hash`
/// rather than the raw secret.
pub struct Operator {
    pub token_hash: String,
}

/// Checks `Authorization: Bearer <token>` against `config.operator_tokens`.
/// Returns `ErrorKind::Validation` (mapped to `400` by the caller) if
/// missing or unrecognized; the shared error taxonomy has no
/// auth-specific variant, so this reads like any other rejected input.
pub fn require_operator(headers: &HeaderMap, config: &Config) -> Result<Operator, EngineError> {
    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| EngineError::new(ErrorKind::Validation, "missing Authorization header"))?;
    let token = header_value
        .strip_prefix("Bearer ")
        .ok_or_else(|| EngineError::new(ErrorKind::Validation, "expected a Bearer token"))?;
    if !config.is_operator_token(token) {
        return Err(EngineError::new(ErrorKind::Validation, "unrecognized operator token"));
    }
    Ok(Operator {
        token_hash: hex::encode(Sha256::digest(token.as_bytes())),
    })
}
