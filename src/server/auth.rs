//! Bearer credentials for registered projects.
//!
//! A credential has the form `{project_id}.{secret}`. `.` is outside the
//! identifier alphabet, so the project row is found directly and only the
//! secret is compared. Stored form is hex `SHA-256(salt || secret)` with a
//! per-project random salt.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use wfc_common::validate_identifier;

use super::api::{ApiError, SharedState};
use crate::errors::{Result, ReviewError};
use crate::jobs::{JobStore, ProjectRecord};

const SALT_BYTES: usize = 16;
const SECRET_BYTES: usize = 32;

/// Project identity proven by a valid bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedProject(pub String);

/// Create a new project record and the plaintext credential to hand out once.
pub fn issue_credential(project_id: &str) -> Result<(ProjectRecord, String)> {
    validate_identifier("project_id", project_id)?;
    let salt = random_hex::<SALT_BYTES>();
    let secret = random_hex::<SECRET_BYTES>();
    let record = ProjectRecord {
        project_id: project_id.to_string(),
        token_hash: hash_secret(&salt, &secret),
        salt,
        created_at: Utc::now(),
    };
    Ok((record, format!("{project_id}.{secret}")))
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_secret(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Resolve a credential to its project, or `Unauthorized`.
pub async fn verify_credential(store: &JobStore, credential: &str) -> Result<String> {
    let (project_id, secret) = credential.split_once('.').ok_or(ReviewError::Unauthorized)?;
    if validate_identifier("project_id", project_id).is_err() || secret.is_empty() {
        return Err(ReviewError::Unauthorized);
    }
    let record = store
        .get_project(project_id)
        .await?
        .ok_or(ReviewError::Unauthorized)?;

    let candidate = hash_secret(&record.salt, secret);
    if constant_time_eq(candidate.as_bytes(), record.token_hash.as_bytes()) {
        Ok(record.project_id)
    } else {
        Err(ReviewError::Unauthorized)
    }
}

impl FromRequestParts<SharedState> for AuthenticatedProject {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let credential = bearer_token(&parts.headers).ok_or(ReviewError::Unauthorized)?;
        match verify_credential(&state.executor.context().store, credential).await {
            Ok(project_id) => Ok(Self(project_id)),
            Err(e) => {
                tracing::warn!(path = %parts.uri.path(), "Rejected request credential");
                Err(e.into())
            }
        }
    }
}

/// Admin check for project registration. With no admin token configured,
/// registration is open.
pub fn check_admin(headers: &HeaderMap, admin_token: Option<&str>) -> Result<()> {
    let Some(expected) = admin_token else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(given) if constant_time_eq(given.as_bytes(), expected.as_bytes()) => Ok(()),
        Some(_) => Err(ReviewError::Forbidden("admin token required".into())),
        None => Err(ReviewError::Unauthorized),
    }
}
