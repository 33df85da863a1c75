use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wfc_common::JobStatus;

use crate::consensus::ConsensusResult;

/// Durable record of one submitted review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewJob {
    pub job_id: Uuid,
    pub project_id: String,
    pub developer_id: String,
    pub task_id: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ConsensusResult>,
    pub error: Option<String>,
}

/// Input for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub project_id: String,
    pub developer_id: String,
    pub task_id: String,
}

/// Registered project and its hashed credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub project_id: String,
    pub salt: String,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
}
