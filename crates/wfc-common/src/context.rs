//! Project identity and on-disk namespacing.
//!
//! A [`ProjectContext`] is built once per request from validated identifiers
//! and then passed by value. Every path a job may touch is derived from it,
//! so two projects can never share a directory or a branch even when they
//! submit identical task identifiers.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("identifier pattern compiles"));

/// Check that `value` is a safe identifier for use in paths and branch names.
///
/// The allowed alphabet has no `.`, `/` or `\`, so traversal sequences such
/// as `..` or `a/../b` cannot pass.
///
/// # Examples
///
/// ```
/// use wfc_common::validate_identifier;
///
/// assert!(validate_identifier("project_id", "acme-web_2").is_ok());
/// assert!(validate_identifier("project_id", "../etc").is_err());
/// assert!(validate_identifier("project_id", "").is_err());
/// ```
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

/// Directory holding every worktree of one project.
pub fn worktree_namespace(root: &Path, project_id: &str) -> PathBuf {
    root.join(".worktrees").join(project_id)
}

/// `{root}/.worktrees/{project_id}/wfc-{task_id}`
pub fn worktree_path(root: &Path, project_id: &str, task_id: &str) -> PathBuf {
    worktree_namespace(root, project_id).join(format!("wfc-{}", task_id))
}

/// `wfc/{project_id}/{task_id}`
pub fn branch_name(project_id: &str, task_id: &str) -> String {
    format!("wfc/{}/{}", project_id, task_id)
}

/// Immutable identity and namespace descriptor for a (project, developer) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    project_id: String,
    developer_id: String,
    repo_path: PathBuf,
    worktree_root: PathBuf,
    output_dir: PathBuf,
    metrics_dir: PathBuf,
}

impl ProjectContext {
    /// Validate identifiers and derive the per-project directories: worktrees
    /// under `worktree_root`, review output and metrics under `data_root`.
    pub fn new(
        project_id: &str,
        developer_id: &str,
        repo_path: impl Into<PathBuf>,
        worktree_root: &Path,
        data_root: &Path,
    ) -> Result<Self, ValidationError> {
        validate_identifier("project_id", project_id)?;
        validate_identifier("developer_id", developer_id)?;

        Ok(Self {
            project_id: project_id.to_string(),
            developer_id: developer_id.to_string(),
            repo_path: repo_path.into(),
            worktree_root: worktree_namespace(worktree_root, project_id),
            output_dir: data_root.join("output").join(project_id).join(developer_id),
            metrics_dir: data_root.join("metrics").join(project_id),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn developer_id(&self) -> &str {
        &self.developer_id
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn metrics_dir(&self) -> &Path {
        &self.metrics_dir
    }
}
