//! Typed error hierarchy for the review orchestration core.
//!
//! One enum, `ReviewError`, carries the whole taxonomy so that every layer
//! (pool, rate limiter, knowledge log, job store, orchestrator, HTTP API)
//! can classify a failure the same way:
//!
//! | Variant                  | Fatal | Retryable | Typical source            |
//! |--------------------------|-------|-----------|---------------------------|
//! | `Validation`             | yes   | no        | request / reviewer output |
//! | `ResourceExhausted`      | no    | yes       | worktree pool, executor   |
//! | `RateLimitExceeded`      | no    | yes       | token bucket              |
//! | `LockTimeout`            | no    | yes       | knowledge log             |
//! | `PathTraversal`          | yes   | no        | knowledge log             |
//! | `OrchestrationFailure`   | no    | no        | job execution             |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;
use wfc_common::{JobStatus, ValidationError};

pub type Result<T, E = ReviewError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{resource} exhausted after waiting {waited:?}")]
    ResourceExhausted {
        resource: &'static str,
        waited: Duration,
    },

    #[error("Rate limit exceeded: {requested} token(s) not available within {waited:?}")]
    RateLimitExceeded { requested: u32, waited: Duration },

    #[error("Timed out acquiring lock on {path} after {attempts} attempt(s)")]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("Path {requested} escapes the allowed root {root}")]
    PathTraversal { requested: PathBuf, root: PathBuf },

    #[error("Orchestration failed: {0}")]
    OrchestrationFailure(String),

    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    #[error("Project {project_id} is already registered")]
    DuplicateProject { project_id: String },

    #[error("Invalid or missing credential")]
    Unauthorized,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReviewError {
    /// Contention errors a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::RateLimitExceeded { .. } | Self::LockTimeout { .. }
        )
    }

    /// Errors that must never be retried: the input itself is unacceptable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::PathTraversal { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<rusqlite::Error> for ReviewError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.into())
    }
}
