//! Review orchestration.
//!
//! ## Components
//!
//! - [`ExecutionContext`]: the process-wide resources every job shares
//! - [`runner`]: one job from slot acquisition to terminal state
//! - [`executor`]: bounded background execution, cancellation, recovery
//!
//! Resources are built once at startup and handed to jobs through an
//! `Arc<ExecutionContext>`; nothing is reached through global state, and
//! jobs never hold a reference back to the executor.

pub mod executor;
pub mod runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wfc_common::{ProjectContext, ReviewerRole, ValidationError};

use crate::consensus::ConsensusScorer;
use crate::jobs::JobStore;
use crate::knowledge::KnowledgeStore;
use crate::pool::WorktreePool;
use crate::ratelimit::TokenBucket;
use crate::reviewer::Reviewer;

pub use executor::{BackgroundExecutor, ExecutorConfig, ReviewSubmission};
pub use runner::Orchestrator;

/// Per-job orchestration knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Roles run for every job, in reservation order.
    pub roles: Vec<ReviewerRole>,
    pub max_parallel_reviewers: usize,
    pub tokens_per_pass: u32,
    pub worktree_timeout: Duration,
    pub rate_limit_timeout: Duration,
    /// Findings at or above this risk are written to the knowledge log.
    pub knowledge_min_risk: f64,
    /// Directory holding one repository per project (`{repos_root}/{project_id}`).
    pub repos_root: PathBuf,
    /// Root the worktree pool materializes slots under.
    pub worktree_root: PathBuf,
    /// Parent of per-project `output/` and `metrics/` directories.
    pub data_root: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(
        data_root: impl Into<PathBuf>,
        worktree_root: impl Into<PathBuf>,
        repos_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            roles: ReviewerRole::all(),
            max_parallel_reviewers: 5,
            tokens_per_pass: 1,
            worktree_timeout: Duration::from_secs(60),
            rate_limit_timeout: Duration::from_secs(30),
            knowledge_min_risk: 5.0,
            repos_root: repos_root.into(),
            worktree_root: worktree_root.into(),
            data_root: data_root.into(),
        }
    }

    pub fn repo_path(&self, project_id: &str) -> PathBuf {
        self.repos_root.join(project_id)
    }

    pub fn project_context(&self, project_id: &str, developer_id: &str) -> Result<ProjectContext, ValidationError> {
        ProjectContext::new(
            project_id,
            developer_id,
            self.repo_path(project_id),
            &self.worktree_root,
            &self.data_root,
        )
    }
}

/// Shared resources handed to every job.
pub struct ExecutionContext {
    pub pool: WorktreePool,
    pub bucket: TokenBucket,
    pub knowledge: KnowledgeStore,
    pub store: JobStore,
    pub reviewer: Arc<dyn Reviewer>,
    pub scorer: ConsensusScorer,
    pub config: OrchestratorConfig,
}
