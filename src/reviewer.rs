//! Reviewer-execution capability.
//!
//! The orchestrator never knows how a review is produced; it calls
//! [`Reviewer::run`] once per role. Implementations:
//!
//! - [`CommandReviewer`]: spawns an external command per pass, writes the
//!   request as JSON on stdin and reads a JSON array of findings from stdout.
//! - [`StaticReviewer`]: returns preconfigured findings (dry runs, tests).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wfc_common::{Finding, ReviewerRole};

use crate::errors::{Result, ReviewError};

/// How long a cancelled reviewer process may keep running before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Everything a reviewer pass sees about the change under review.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewRequest {
    pub job_id: Uuid,
    pub project_id: String,
    pub developer_id: String,
    pub task_id: String,
    pub files: Vec<String>,
    pub diff_content: String,
    pub worktree_path: PathBuf,
    /// Where a reviewer may leave report artifacts for this developer.
    pub output_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn run(
        &self,
        request: &ReviewRequest,
        role: ReviewerRole,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>>;
}

#[derive(Serialize)]
struct PassInput<'a> {
    role: ReviewerRole,
    #[serde(flatten)]
    request: &'a ReviewRequest,
}

pub struct CommandReviewer {
    program: String,
    args: Vec<String>,
    grace_period: Duration,
}

impl CommandReviewer {
    /// Build from a whitespace-separated command line, e.g. `"review-bot --json"`.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(wfc_common::ValidationError::Empty {
            field: "review.command",
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            grace_period: DEFAULT_GRACE_PERIOD,
        })
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn run(
        &self,
        request: &ReviewRequest,
        role: ReviewerRole,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>> {
        let input = serde_json::to_vec(&PassInput { role, request })
            .context("Failed to encode reviewer input")?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("WFC_REVIEWER_ROLE", role.as_str())
            .env("WFC_TASK_ID", &request.task_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if request.worktree_path.is_dir() {
            cmd.current_dir(&request.worktree_path);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn reviewer '{}'", self.program))?;
        tracing::debug!(
            job_id = %request.job_id,
            role = %role,
            pid = child.id().unwrap_or(0),
            "Reviewer process spawned"
        );

        let mut stdin = child.stdin.take().context("Failed to open reviewer stdin")?;
        let mut stdout = child.stdout.take().context("Failed to open reviewer stdout")?;
        let mut stderr = child.stderr.take().context("Failed to open reviewer stderr")?;

        // Feed stdin and drain both pipes concurrently so a chatty reviewer
        // cannot deadlock on a full pipe.
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });
        let out_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });
        let err_reader = tokio::spawn(async move {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.map(|_| buf)
        });

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for reviewer")?,
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %request.job_id, role = %role, "Cancelling reviewer pass");
                match tokio::time::timeout(self.grace_period, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(role = %role, error = %e, "Failed to kill reviewer process");
                        }
                    }
                }
                return Err(ReviewError::OrchestrationFailure(format!("{role} pass cancelled")));
            }
        };

        if let Ok(Err(e)) = writer.await {
            // A reviewer may legitimately exit before reading all of stdin.
            tracing::debug!(role = %role, error = %e, "Reviewer closed stdin early");
        }
        let stdout = out_reader
            .await
            .context("Reviewer stdout task failed")?
            .context("Failed to read reviewer stdout")?;
        let stderr = err_reader
            .await
            .context("Reviewer stderr task failed")?
            .unwrap_or_default();

        if !status.success() {
            return Err(ReviewError::OrchestrationFailure(format!(
                "{role} reviewer exited with {status}: {}",
                stderr.trim()
            )));
        }

        parse_findings(&stdout, role)
    }
}

/// Parse a JSON array of findings. Entries without a `reviewer_id` are
/// attributed to `role`; entries that fail validation are dropped.
pub fn parse_findings(stdout: &[u8], role: ReviewerRole) -> Result<Vec<Finding>> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(stdout)
        .with_context(|| format!("{role} reviewer did not print a JSON array of findings"))?;

    let mut findings = Vec::with_capacity(values.len());
    for (idx, mut value) in values.into_iter().enumerate() {
        if let Some(obj) = value.as_object_mut() {
            obj.entry("reviewer_id")
                .or_insert_with(|| serde_json::Value::String(role.as_str().to_string()));
        }
        match serde_json::from_value::<Finding>(value) {
            Ok(finding) => findings.push(finding),
            Err(e) => tracing::warn!(role = %role, index = idx, error = %e, "Dropping invalid finding"),
        }
    }
    Ok(findings)
}

/// Returns the same findings on every call.
#[derive(Debug, Clone, Default)]
pub struct StaticReviewer {
    findings: HashMap<ReviewerRole, Vec<Finding>>,
}

impl StaticReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_findings(mut self, role: ReviewerRole, findings: Vec<Finding>) -> Self {
        self.findings.insert(role, findings);
        self
    }
}

#[async_trait]
impl Reviewer for StaticReviewer {
    async fn run(
        &self,
        _request: &ReviewRequest,
        role: ReviewerRole,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Finding>> {
        Ok(self.findings.get(&role).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) fn test_request() -> ReviewRequest {
    ReviewRequest {
        job_id: Uuid::nil(),
        project_id: "p1".into(),
        developer_id: "alice".into(),
        task_id: "T".into(),
        files: vec!["src/lib.rs".into()],
        diff_content: "+fn main() {}".into(),
        worktree_path: std::env::temp_dir(),
        output_dir: std::env::temp_dir().join("output/p1/alice"),
        metrics_dir: std::env::temp_dir().join("metrics/p1"),
    }
}
