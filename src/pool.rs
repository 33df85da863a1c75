//! Bounded, namespaced pool of isolated worktrees.
//!
//! ## Invariants
//!
//! - At most `max_worktrees` entries exist in the active set, counting slots
//!   that are still being provisioned or torn down.
//! - Every active entry has a distinct path (`{root}/.worktrees/{project}/wfc-{task}`)
//!   and therefore a distinct branch (`wfc/{project}/{task}`).
//! - The active-set mutex is never held across provisioning I/O or a wait.
//!
//! ## Lifecycle of a slot
//!
//! ```text
//! acquire ──> Provisioning ──create ok──> Ready ──release/sweep──> Releasing ──destroy──> (gone)
//!                  ├──create failed──> (gone)
//!                  └──acquire dropped──> Releasing ──destroy──> (gone)
//! ```
//!
//! An acquisition abandoned mid-create (job timeout, cancellation) tears down
//! whatever the provisioner left behind, so the slot is never stranded in
//! `Provisioning`.
//!
//! An entry stays in the set while it is `Releasing`, so a new acquisition of
//! the same namespace cannot race the teardown of the old directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wfc_common::{branch_name, validate_identifier, worktree_path};

use crate::errors::{Result, ReviewError};
use crate::provision::WorktreeProvisioner;

/// Default age after which an unreleased slot is considered orphaned.
pub const DEFAULT_ORPHAN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub root: PathBuf,
    pub max_worktrees: usize,
    pub orphan_ttl: Duration,
}

impl PoolConfig {
    pub fn new(root: impl Into<PathBuf>, max_worktrees: usize) -> Self {
        Self {
            root: root.into(),
            max_worktrees,
            orphan_ttl: DEFAULT_ORPHAN_TTL,
        }
    }

    pub fn with_orphan_ttl(mut self, ttl: Duration) -> Self {
        self.orphan_ttl = ttl;
        self
    }
}

/// A materialized worktree owned by exactly one job.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeSlot {
    pub project_id: String,
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    #[serde(skip)]
    pub repo_path: PathBuf,
    pub acquired_at: DateTime<Utc>,
    #[serde(skip)]
    lease_id: Uuid,
    #[serde(skip)]
    acquired_instant: Instant,
}

/// Pool occupancy for `GET /resources/pool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max: usize,
    pub active: usize,
    pub available: usize,
    pub orphaned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Provisioning,
    Ready,
    Releasing,
}

#[derive(Debug)]
struct SlotEntry {
    slot: WorktreeSlot,
    state: SlotState,
}

struct Inner {
    config: PoolConfig,
    provisioner: Arc<dyn WorktreeProvisioner>,
    active: Mutex<HashMap<PathBuf, SlotEntry>>,
    released: Notify,
}

/// Shared handle to the worktree pool. Cheap to clone.
#[derive(Clone)]
pub struct WorktreePool {
    inner: Arc<Inner>,
}

enum Attempt {
    Reserved(WorktreeSlot),
    Reclaimed(Vec<WorktreeSlot>),
    Wait,
}

impl WorktreePool {
    pub fn new(config: PoolConfig, provisioner: Arc<dyn WorktreeProvisioner>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                provisioner,
                active: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    // Entries are inserted and removed whole; a poisoned lock still guards a
    // consistent map.
    fn active(&self) -> MutexGuard<'_, HashMap<PathBuf, SlotEntry>> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve and materialize a worktree for `(project_id, task_id)`.
    ///
    /// Waits up to `timeout` while the pool is full or the same namespace is
    /// still held, reclaiming orphans before each wait. Never returns a
    /// partially-provisioned slot.
    pub async fn acquire(
        &self,
        project_id: &str,
        task_id: &str,
        repo_path: &Path,
        timeout: Duration,
    ) -> Result<WorktreeLease> {
        validate_identifier("project_id", project_id)?;
        validate_identifier("task_id", task_id)?;

        let path = worktree_path(&self.inner.config.root, project_id, task_id);
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            // Register interest before inspecting the set so a release that
            // lands between the check and the wait is not missed.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let attempt = self.try_reserve(project_id, task_id, repo_path, &path);

            match attempt {
                Attempt::Reserved(slot) => return self.provision(slot).await,
                Attempt::Reclaimed(orphans) => {
                    self.teardown(orphans).await;
                    continue;
                }
                Attempt::Wait => {}
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    project_id,
                    task_id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Worktree pool exhausted"
                );
                return Err(ReviewError::ResourceExhausted {
                    resource: "worktree pool",
                    waited: started.elapsed(),
                });
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    fn try_reserve(
        &self,
        project_id: &str,
        task_id: &str,
        repo_path: &Path,
        path: &Path,
    ) -> Attempt {
        let mut active = self.active();

        if active.contains_key(path) {
            return Attempt::Wait;
        }

        if active.len() < self.inner.config.max_worktrees {
            let slot = WorktreeSlot {
                project_id: project_id.to_string(),
                task_id: task_id.to_string(),
                path: path.to_path_buf(),
                branch: branch_name(project_id, task_id),
                repo_path: repo_path.to_path_buf(),
                acquired_at: Utc::now(),
                lease_id: Uuid::new_v4(),
                acquired_instant: Instant::now(),
            };
            active.insert(
                path.to_path_buf(),
                SlotEntry {
                    slot: slot.clone(),
                    state: SlotState::Provisioning,
                },
            );
            return Attempt::Reserved(slot);
        }

        let orphans = Self::mark_orphans(&mut active, self.inner.config.orphan_ttl);
        if orphans.is_empty() {
            Attempt::Wait
        } else {
            Attempt::Reclaimed(orphans)
        }
    }

    async fn provision(&self, slot: WorktreeSlot) -> Result<WorktreeLease> {
        let guard = ProvisionGuard {
            pool: self,
            slot: &slot,
            armed: true,
        };
        let created = self
            .inner
            .provisioner
            .create(&slot.repo_path, &slot.path, &slot.branch)
            .await;
        guard.disarm();

        match created {
            Ok(()) => {
                if let Some(entry) = self.active().get_mut(&slot.path) {
                    entry.state = SlotState::Ready;
                }
                tracing::info!(
                    project_id = %slot.project_id,
                    task_id = %slot.task_id,
                    path = %slot.path.display(),
                    branch = %slot.branch,
                    "Worktree acquired"
                );
                Ok(WorktreeLease {
                    pool: self.clone(),
                    slot,
                    released: AtomicBool::new(false),
                })
            }
            Err(e) => {
                self.forget(&slot);
                tracing::error!(
                    project_id = %slot.project_id,
                    task_id = %slot.task_id,
                    error = %e,
                    "Worktree provisioning failed"
                );
                Err(ReviewError::Other(e.context(format!(
                    "Failed to provision worktree {}",
                    slot.path.display()
                ))))
            }
        }
    }

    fn mark_orphans(active: &mut HashMap<PathBuf, SlotEntry>, ttl: Duration) -> Vec<WorktreeSlot> {
        let now = Instant::now();
        active
            .values_mut()
            .filter(|e| {
                e.state == SlotState::Ready
                    && now.saturating_duration_since(e.slot.acquired_instant) >= ttl
            })
            .map(|e| {
                e.state = SlotState::Releasing;
                e.slot.clone()
            })
            .collect()
    }

    async fn teardown(&self, slots: Vec<WorktreeSlot>) {
        for slot in slots {
            tracing::warn!(
                project_id = %slot.project_id,
                task_id = %slot.task_id,
                path = %slot.path.display(),
                "Reclaiming orphaned worktree"
            );
            self.destroy_and_forget(&slot).await;
        }
    }

    async fn destroy_and_forget(&self, slot: &WorktreeSlot) {
        if let Err(e) = self
            .inner
            .provisioner
            .destroy(&slot.repo_path, &slot.path, &slot.branch)
            .await
        {
            tracing::warn!(path = %slot.path.display(), error = %e, "Worktree teardown failed");
        }
        self.forget(slot);
    }

    /// Drop `slot` from the active set if it still owns its path, then wake waiters.
    fn forget(&self, slot: &WorktreeSlot) {
        {
            let mut active = self.active();
            if active
                .get(&slot.path)
                .is_some_and(|e| e.slot.lease_id == slot.lease_id)
            {
                active.remove(&slot.path);
            }
        }
        self.inner.released.notify_waiters();
    }

    /// Release a slot. Returns `false` (and does nothing) if it was already
    /// released or reclaimed.
    pub async fn release(&self, slot: &WorktreeSlot) -> bool {
        let claimed = {
            let mut active = self.active();
            match active.get_mut(&slot.path) {
                Some(entry)
                    if entry.slot.lease_id == slot.lease_id
                        && entry.state != SlotState::Releasing =>
                {
                    entry.state = SlotState::Releasing;
                    true
                }
                _ => false,
            }
        };

        if !claimed {
            tracing::debug!(
                project_id = %slot.project_id,
                task_id = %slot.task_id,
                "Worktree already released"
            );
            return false;
        }

        self.destroy_and_forget(slot).await;
        tracing::info!(
            project_id = %slot.project_id,
            task_id = %slot.task_id,
            held_ms = slot.acquired_instant.elapsed().as_millis() as u64,
            "Worktree released"
        );
        true
    }

    /// Reclaim every slot older than the orphan TTL. Returns how many were reclaimed.
    pub async fn sweep_orphans(&self) -> usize {
        let orphans = Self::mark_orphans(&mut self.active(), self.inner.config.orphan_ttl);
        let count = orphans.len();
        self.teardown(orphans).await;
        count
    }

    /// Run [`sweep_orphans`](Self::sweep_orphans) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = pool.sweep_orphans().await;
                        if reclaimed > 0 {
                            tracing::info!(reclaimed, "Background sweep reclaimed orphaned worktrees");
                        }
                    }
                }
            }
            tracing::debug!("Worktree sweeper stopped");
        })
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.active();
        let ttl = self.inner.config.orphan_ttl;
        let now = Instant::now();
        let orphaned = active
            .values()
            .filter(|e| {
                e.state == SlotState::Ready
                    && now.saturating_duration_since(e.slot.acquired_instant) >= ttl
            })
            .count();
        let max = self.inner.config.max_worktrees;
        PoolStats {
            max,
            active: active.len(),
            available: max.saturating_sub(active.len()),
            orphaned,
        }
    }
}

/// Tears down a `Provisioning` entry whose acquire future was dropped
/// before `create` returned.
struct ProvisionGuard<'a> {
    pool: &'a WorktreePool,
    slot: &'a WorktreeSlot,
    armed: bool,
}

impl ProvisionGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProvisionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut active = self.pool.active();
            match active.get_mut(&self.slot.path) {
                Some(entry) if entry.slot.lease_id == self.slot.lease_id => {
                    entry.state = SlotState::Releasing;
                }
                _ => return,
            }
        }
        tracing::warn!(
            project_id = %self.slot.project_id,
            task_id = %self.slot.task_id,
            path = %self.slot.path.display(),
            "Worktree provisioning abandoned"
        );

        let pool = self.pool.clone();
        let slot = self.slot.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.destroy_and_forget(&slot).await;
                });
            }
            Err(_) => pool.forget(&slot),
        }
    }
}

/// Scoped ownership of one worktree slot.
///
/// Call [`release`](Self::release) when done; if the lease is dropped
/// without that, teardown is spawned on the current runtime.
pub struct WorktreeLease {
    pool: WorktreePool,
    slot: WorktreeSlot,
    released: AtomicBool,
}

impl WorktreeLease {
    pub fn slot(&self) -> &WorktreeSlot {
        &self.slot
    }

    pub fn path(&self) -> &Path {
        &self.slot.path
    }

    pub fn branch(&self) -> &str {
        &self.slot.branch
    }

    /// Release the slot. Only the first call has any effect.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(path = %self.slot.path.display(), "Lease already released");
            return false;
        }
        self.pool.release(&self.slot).await
    }
}

impl Drop for WorktreeLease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.pool.clone();
        let slot = self.slot.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.release(&slot).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    path = %slot.path.display(),
                    "Lease dropped outside a runtime; leaving worktree for the orphan sweep"
                );
            }
        }
    }
}
