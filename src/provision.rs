//! Worktree provisioning capability.
//!
//! The pool decides *whether* and *where* a worktree may exist; a
//! [`WorktreeProvisioner`] materializes and tears it down. Two
//! implementations exist:
//!
//! - [`GitWorktreeProvisioner`]: `git worktree add -B <branch> <path>` against
//!   the project's repository, removed with `git worktree remove --force`.
//! - [`DirectoryProvisioner`]: a plain directory, for checkouts that are not
//!   git repositories.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Creates and destroys isolated working directories.
#[async_trait]
pub trait WorktreeProvisioner: Send + Sync {
    async fn create(&self, repo_path: &Path, path: &Path, branch: &str) -> Result<()>;

    async fn destroy(&self, repo_path: &Path, path: &Path, branch: &str) -> Result<()>;
}

/// Which provisioner to build from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    #[default]
    Git,
    Directory,
}

impl ProvisionerKind {
    pub fn build(self) -> Arc<dyn WorktreeProvisioner> {
        match self {
            Self::Git => Arc::new(GitWorktreeProvisioner),
            Self::Directory => Arc::new(DirectoryProvisioner),
        }
    }
}

impl std::fmt::Display for ProvisionerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

async fn run_git(repo_path: &Path, args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}

pub struct GitWorktreeProvisioner;

#[async_trait]
impl WorktreeProvisioner for GitWorktreeProvisioner {
    async fn create(&self, repo_path: &Path, path: &Path, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let path_str = path.to_string_lossy();
        // -B resets a branch left behind by a crashed run instead of failing.
        run_git(repo_path, &["worktree", "add", "-B", branch, &path_str, "HEAD"]).await
    }

    async fn destroy(&self, repo_path: &Path, path: &Path, branch: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        if let Err(e) = run_git(repo_path, &["worktree", "remove", "--force", &path_str]).await {
            tracing::debug!(path = %path.display(), error = %e, "git worktree remove failed, pruning");
            if path.exists() {
                tokio::fs::remove_dir_all(path)
                    .await
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            run_git(repo_path, &["worktree", "prune"]).await?;
        }
        if let Err(e) = run_git(repo_path, &["branch", "-D", branch]).await {
            tracing::debug!(branch, error = %e, "Branch cleanup skipped");
        }
        Ok(())
    }
}

pub struct DirectoryProvisioner;

#[async_trait]
impl WorktreeProvisioner for DirectoryProvisioner {
    async fn create(&self, _repo_path: &Path, path: &Path, _branch: &str) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create worktree directory {}", path.display()))
    }

    async fn destroy(&self, _repo_path: &Path, path: &Path, _branch: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

/// Test double that counts calls and can be told to fail creation.
#[cfg(test)]
pub(crate) struct RecordingProvisioner {
    pub creates: std::sync::atomic::AtomicUsize,
    pub destroys: std::sync::atomic::AtomicUsize,
    pub fail_create: bool,
}

#[cfg(test)]
impl RecordingProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            creates: Default::default(),
            destroys: Default::default(),
            fail_create: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            creates: Default::default(),
            destroys: Default::default(),
            fail_create: true,
        })
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl WorktreeProvisioner for RecordingProvisioner {
    async fn create(&self, repo_path: &Path, path: &Path, branch: &str) -> Result<()> {
        self.creates.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_create {
            anyhow::bail!("simulated provisioning failure");
        }
        DirectoryProvisioner.create(repo_path, path, branch).await
    }

    async fn destroy(&self, repo_path: &Path, path: &Path, branch: &str) -> Result<()> {
        self.destroys.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        DirectoryProvisioner.destroy(repo_path, path, branch).await
    }
}
