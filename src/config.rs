//! Configuration for the wfc review service.
//!
//! Settings are read from `.wfc/wfc.toml` and layered:
//! file → environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8470
//! admin_token = "change-me"
//!
//! [pool]
//! max_worktrees = 10
//! provisioner = "git"
//!
//! [rate_limit]
//! capacity = 10
//! refill_rate = 10.0
//!
//! [knowledge]
//! min_risk = 5.0
//!
//! [jobs]
//! max_concurrent = 4
//! timeout_secs = 600
//!
//! [review]
//! command = "review-bot --json"
//!
//! [scoring]
//! protected_roles = ["security", "reliability"]
//! minority_threshold = 8.5
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```
//!
//! # Environment overrides
//!
//! | Variable             | Setting               |
//! |----------------------|-----------------------|
//! | `WFC_PORT`           | `server.port`         |
//! | `WFC_ADMIN_TOKEN`    | `server.admin_token`  |
//! | `WFC_MAX_WORKTREES`  | `pool.max_worktrees`  |
//! | `WFC_DB_PATH`        | `jobs.db_path`        |
//! | `WFC_LOG_LEVEL`      | `logging.level`       |
//! | `WFC_REVIEW_COMMAND` | `review.command`      |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use wfc_common::ReviewerRole;

use crate::consensus::{ConsensusScorer, ScoringConfig};
use crate::jobs::JobStore;
use crate::knowledge::KnowledgeStore;
use crate::orchestrator::{ExecutionContext, ExecutorConfig, OrchestratorConfig};
use crate::pool::{PoolConfig, WorktreePool};
use crate::provision::ProvisionerKind;
use crate::ratelimit::TokenBucket;
use crate::reviewer::{CommandReviewer, Reviewer, StaticReviewer};

pub const CONFIG_FILE: &str = "wfc.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Bearer token required for `POST /projects`. Open registration if unset.
    pub admin_token: Option<String>,
    /// Allow any origin (development only).
    pub cors_permissive: bool,
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
            admin_token: None,
            cors_permissive: false,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_worktrees: usize,
    /// Directory under which `.worktrees/{project_id}/` is created.
    /// Defaults to the data directory.
    pub root: Option<PathBuf>,
    pub provisioner: ProvisionerKind,
    pub acquire_timeout_secs: u64,
    pub orphan_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_worktrees: 10,
            root: None,
            provisioner: ProvisionerKind::default(),
            acquire_timeout_secs: 60,
            orphan_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub capacity: u32,
    /// Tokens per second.
    pub refill_rate: f64,
    pub timeout_secs: u64,
    pub tokens_per_pass: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_rate: 10.0,
            timeout_secs: 30,
            tokens_per_pass: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeSection {
    /// Defaults to `{data_dir}/knowledge`.
    pub root: Option<PathBuf>,
    pub min_risk: f64,
    pub lock_timeout_secs: u64,
    pub max_lock_wait_secs: u64,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            root: None,
            min_risk: 5.0,
            lock_timeout_secs: 2,
            max_lock_wait_secs: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// Defaults to `{data_dir}/wfc.db`.
    pub db_path: Option<PathBuf>,
    pub max_concurrent: usize,
    pub max_pending: usize,
    pub timeout_secs: u64,
    pub stale_after_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        let executor = ExecutorConfig::default();
        Self {
            db_path: None,
            max_concurrent: executor.max_concurrent_jobs,
            max_pending: executor.max_pending,
            timeout_secs: executor.job_timeout.as_secs(),
            stale_after_secs: executor.stale_after.as_secs(),
            maintenance_interval_secs: executor.maintenance_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSection {
    /// External reviewer command run once per role. Without one, reviews
    /// run against a reviewer that reports no findings.
    pub command: Option<String>,
    pub roles: Vec<ReviewerRole>,
    pub max_parallel: usize,
    pub grace_period_secs: u64,
    /// Directory holding one repository per project.
    pub repos_root: Option<PathBuf>,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            command: None,
            roles: ReviewerRole::all(),
            max_parallel: 5,
            grace_period_secs: 5,
            repos_root: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
    /// Daily-rolling log files are written here when set.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// The complete wfc.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WfcToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub knowledge: KnowledgeSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl WfcToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse wfc.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize wfc.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `WFC_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("WFC_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("WFC_PORT must be a port number, got '{}'", port))?;
        }
        if let Some(token) = lookup("WFC_ADMIN_TOKEN") {
            self.server.admin_token = Some(token);
        }
        if let Some(max) = lookup("WFC_MAX_WORKTREES") {
            self.pool.max_worktrees = max
                .parse()
                .with_context(|| format!("WFC_MAX_WORKTREES must be an integer, got '{}'", max))?;
        }
        if let Some(path) = lookup("WFC_DB_PATH") {
            self.jobs.db_path = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("WFC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(command) = lookup("WFC_REVIEW_COMMAND") {
            self.review.command = Some(command).filter(|c| !c.trim().is_empty());
        }
        Ok(())
    }

    /// Errors for settings the service cannot run with.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.pool.max_worktrees == 0 {
            errors.push("pool.max_worktrees must be at least 1".to_string());
        }
        if self.rate_limit.capacity == 0 {
            errors.push("rate_limit.capacity must be at least 1".to_string());
        }
        if !(self.rate_limit.refill_rate.is_finite() && self.rate_limit.refill_rate >= 0.0) {
            errors.push(format!(
                "rate_limit.refill_rate must be a non-negative number, got {}",
                self.rate_limit.refill_rate
            ));
        }
        let per_job = self.rate_limit.tokens_per_pass as u64 * self.review.roles.len() as u64;
        if per_job > self.rate_limit.capacity as u64 {
            errors.push(format!(
                "a review needs {} tokens but rate_limit.capacity is {}",
                per_job, self.rate_limit.capacity
            ));
        }
        if self.review.roles.is_empty() {
            errors.push("review.roles must name at least one role".to_string());
        }
        if self.review.max_parallel == 0 {
            errors.push("review.max_parallel must be at least 1".to_string());
        }
        if self.jobs.max_concurrent == 0 {
            errors.push("jobs.max_concurrent must be at least 1".to_string());
        }
        if self.jobs.max_pending < self.jobs.max_concurrent {
            errors.push("jobs.max_pending must be at least jobs.max_concurrent".to_string());
        }
        if self.jobs.timeout_secs == 0 {
            errors.push("jobs.timeout_secs must be at least 1".to_string());
        }
        if !(0.0..=10.0).contains(&self.knowledge.min_risk) {
            errors.push(format!("knowledge.min_risk must be within [0, 10], got {}", self.knowledge.min_risk));
        }
        if !(0.0..=10.0).contains(&self.scoring.minority_threshold) {
            errors.push(format!(
                "scoring.minority_threshold must be within [0, 10], got {}",
                self.scoring.minority_threshold
            ));
        }
        if self.scoring.line_bucket == 0 {
            errors.push("scoring.line_bucket must be at least 1".to_string());
        }
        if self.review.command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            errors.push("review.command must not be blank".to_string());
        }
        if let Err(e) = self.logging.level.parse::<tracing_subscriber::EnvFilter>() {
            errors.push(format!("logging.level '{}' is invalid: {}", self.logging.level, e));
        }

        errors
    }
}

/// Command-line overrides, applied last.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub max_worktrees: Option<usize>,
    pub log_level: Option<String>,
    pub repos_root: Option<PathBuf>,
}

/// Effective configuration: file → environment → CLI.
#[derive(Debug, Clone)]
pub struct WfcConfig {
    pub data_dir: PathBuf,
    pub toml: WfcToml,
}

impl WfcConfig {
    /// Load `{data_dir}/wfc.toml` (defaults if absent) and apply environment overrides.
    pub fn load(data_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::load_with_env(data_dir, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(data_dir: impl Into<PathBuf>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = data_dir.into();
        let path = data_dir.join(CONFIG_FILE);
        let mut toml = if path.exists() {
            WfcToml::load(&path)?
        } else {
            WfcToml::default()
        };
        toml.apply_env(lookup)?;
        Ok(Self { data_dir, toml })
    }

    pub fn with_overrides(mut self, cli: CliOverrides) -> Self {
        if let Some(port) = cli.port {
            self.toml.server.port = port;
        }
        if let Some(max) = cli.max_worktrees {
            self.toml.pool.max_worktrees = max;
        }
        if let Some(level) = cli.log_level {
            self.toml.logging.level = level;
        }
        if let Some(root) = cli.repos_root {
            self.toml.review.repos_root = Some(root);
        }
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.toml
            .jobs
            .db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("wfc.db"))
    }

    pub fn knowledge_root(&self) -> PathBuf {
        self.toml
            .knowledge
            .root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("knowledge"))
    }

    pub fn worktree_root(&self) -> PathBuf {
        self.toml.pool.root.clone().unwrap_or_else(|| self.data_dir.clone())
    }

    pub fn repos_root(&self) -> PathBuf {
        self.toml
            .review
            .repos_root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("repos"))
    }

    /// Fail with every problem at once if the configuration is unusable.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors = self.toml.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "))
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let jobs = &self.toml.jobs;
        ExecutorConfig {
            max_concurrent_jobs: jobs.max_concurrent,
            max_pending: jobs.max_pending,
            job_timeout: Duration::from_secs(jobs.timeout_secs),
            stale_after: Duration::from_secs(jobs.stale_after_secs),
            maintenance_interval: Duration::from_secs(jobs.maintenance_interval_secs.max(1)),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let t = &self.toml;
        let mut config = OrchestratorConfig::new(&self.data_dir, self.worktree_root(), self.repos_root());
        config.roles = t.review.roles.clone();
        config.max_parallel_reviewers = t.review.max_parallel;
        config.tokens_per_pass = t.rate_limit.tokens_per_pass;
        config.worktree_timeout = Duration::from_secs(t.pool.acquire_timeout_secs);
        config.rate_limit_timeout = Duration::from_secs(t.rate_limit.timeout_secs);
        config.knowledge_min_risk = t.knowledge.min_risk;
        config
    }

    pub fn reviewer(&self) -> Result<Arc<dyn Reviewer>> {
        match &self.toml.review.command {
            Some(command) => {
                let reviewer = CommandReviewer::from_command_line(command)?
                    .with_grace_period(Duration::from_secs(self.toml.review.grace_period_secs));
                Ok(Arc::new(reviewer))
            }
            None => {
                tracing::warn!("No review.command configured; reviews will report no findings");
                Ok(Arc::new(StaticReviewer::new()))
            }
        }
    }

    /// Construct the process-wide resources shared by every job.
    pub fn execution_context(&self, store: JobStore) -> Result<ExecutionContext> {
        let t = &self.toml;
        let pool_config = PoolConfig::new(self.worktree_root(), t.pool.max_worktrees)
            .with_orphan_ttl(Duration::from_secs(t.pool.orphan_ttl_secs));

        let knowledge = KnowledgeStore::with_lock_timeouts(
            self.knowledge_root(),
            Duration::from_secs(t.knowledge.lock_timeout_secs),
            Duration::from_secs(t.knowledge.max_lock_wait_secs),
        )?;

        Ok(ExecutionContext {
            pool: WorktreePool::new(pool_config, t.pool.provisioner.build()),
            bucket: TokenBucket::new(t.rate_limit.capacity, t.rate_limit.refill_rate),
            knowledge,
            store,
            reviewer: self.reviewer()?,
            scorer: ConsensusScorer::new(t.scoring.clone()),
            config: self.orchestrator_config(),
        })
    }
}
