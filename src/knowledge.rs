//! Shared, append-only knowledge log.
//!
//! Each target is a JSON Lines file under the knowledge root. Appends are a
//! full read-modify-write cycle performed under two locks:
//!
//! 1. a per-target in-process `tokio::sync::Mutex`, so tasks in this process
//!    queue instead of spinning on the file lock, and
//! 2. an advisory exclusive lock (`fs2`) on a sidecar `<target>.lock`, so
//!    other processes sharing the directory are serialized too.
//!
//! The new content is written to a temp file in the same directory, synced,
//! and renamed over the target, so a crash leaves either the old or the new
//! log and never a torn one.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::Serialize;
use uuid::Uuid;
use wfc_common::{KnowledgeEntry, ValidationError};

use crate::errors::{Result, ReviewError};

/// How long one attempt polls for the file lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Cap on all attempts and backoff sleeps combined.
pub const DEFAULT_MAX_LOCK_WAIT: Duration = Duration::from_secs(6);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Word-set Jaccard similarity at or above which two texts are duplicates.
const NEAR_DUPLICATE_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    pub appended: usize,
    pub skipped: usize,
}

struct Inner {
    root: PathBuf,
    lock_timeout: Duration,
    max_lock_wait: Duration,
    targets: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct KnowledgeStore {
    inner: Arc<Inner>,
}

impl KnowledgeStore {
    /// Open (creating if needed) the knowledge root.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_lock_timeouts(root, DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_LOCK_WAIT)
    }

    pub fn with_lock_timeouts(
        root: impl AsRef<Path>,
        lock_timeout: Duration,
        max_lock_wait: Duration,
    ) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| ReviewError::io(root, e))?;
        let root = root.canonicalize().map_err(|e| ReviewError::io(root, e))?;
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                lock_timeout,
                max_lock_wait,
                targets: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Map a relative target onto a file inside the root, refusing anything
    /// that would land outside it (`..`, absolute paths, symlinked parents).
    pub fn resolve(&self, target: &str) -> Result<PathBuf> {
        let root = &self.inner.root;
        let rel = Path::new(target);
        if target.trim().is_empty() {
            return Err(ValidationError::Empty { field: "target" }.into());
        }

        let lexically_safe = !rel.is_absolute()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        let file_name = rel.file_name();
        if !lexically_safe || file_name.is_none() {
            return Err(self.traversal(target));
        }

        let joined = root.join(rel);
        let parent = joined.parent().unwrap_or(root.as_path());
        fs::create_dir_all(parent).map_err(|e| ReviewError::io(parent, e))?;
        let parent = parent.canonicalize().map_err(|e| ReviewError::io(parent, e))?;
        if !parent.starts_with(root) {
            return Err(self.traversal(target));
        }

        let resolved = parent.join(file_name.unwrap_or_default());
        if fs::symlink_metadata(&resolved).is_ok_and(|m| m.file_type().is_symlink()) {
            return Err(self.traversal(target));
        }
        Ok(resolved)
    }

    fn traversal(&self, target: &str) -> ReviewError {
        tracing::error!(
            security_event = true,
            knowledge_target = target,
            root = %self.inner.root.display(),
            "Rejected knowledge target outside the knowledge root"
        );
        ReviewError::PathTraversal {
            requested: PathBuf::from(target),
            root: self.inner.root.clone(),
        }
    }

    fn target_mutex(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut targets = self
            .inner
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        targets.entry(path.to_path_buf()).or_default().clone()
    }

    /// Append `entries` to `target`, skipping near-duplicates of lines already
    /// in the log (or earlier in the same batch).
    pub async fn append(&self, entries: Vec<KnowledgeEntry>, target: &str) -> Result<AppendOutcome> {
        let path = self.resolve(target)?;
        if entries.is_empty() {
            return Ok(AppendOutcome::default());
        }

        let started = Instant::now();
        let local = self.target_mutex(&path);
        let _local_guard = tokio::time::timeout(self.inner.max_lock_wait, local.lock_owned())
            .await
            .map_err(|_| ReviewError::LockTimeout {
                path: path.clone(),
                attempts: 0,
            })?;

        let remaining = self.inner.max_lock_wait.saturating_sub(started.elapsed());
        let lock_timeout = self.inner.lock_timeout;
        let write_path = path.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let _file_lock = acquire_file_lock(&write_path, lock_timeout, remaining)?;
            merge_and_write(&write_path, entries)
        })
        .await
        .map_err(|e| ReviewError::Other(anyhow::anyhow!("Knowledge append task failed: {e}")))??;

        tracing::debug!(
            knowledge_target = target,
            appended = outcome.appended,
            skipped = outcome.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Knowledge appended"
        );
        Ok(outcome)
    }

    /// Parsed entries of `target`, in file order. Lines that do not parse are
    /// skipped with a warning.
    pub async fn read(&self, target: &str) -> Result<Vec<KnowledgeEntry>> {
        let path = self.resolve(target)?;
        tokio::task::spawn_blocking(move || {
            let lines = read_lines(&path)?;
            Ok(parse_lines(&path, &lines))
        })
        .await
        .map_err(|e| ReviewError::Other(anyhow::anyhow!("Knowledge read task failed: {e}")))?
    }
}

/// Sidecar lock; released when dropped.
struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub(crate) fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn acquire_file_lock(path: &Path, lock_timeout: Duration, max_wait: Duration) -> Result<FileLock> {
    let lock_path = lock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| ReviewError::io(&lock_path, e))?;

    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let attempt_started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(FileLock { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(ReviewError::io(&lock_path, e)),
            }
            if attempt_started.elapsed() >= lock_timeout || started.elapsed() >= max_wait {
                break;
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }

        let elapsed = started.elapsed();
        if elapsed + backoff >= max_wait {
            tracing::warn!(
                path = %path.display(),
                attempts,
                waited_ms = elapsed.as_millis() as u64,
                "Knowledge lock timed out"
            );
            return Err(ReviewError::LockTimeout {
                path: path.to_path_buf(),
                attempts,
            });
        }
        tracing::debug!(path = %path.display(), attempts, "Knowledge lock busy, backing off");
        std::thread::sleep(backoff);
        backoff *= 2;
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ReviewError::io(path, e)),
    }
}

fn parse_lines(path: &Path, lines: &[String]) -> Vec<KnowledgeEntry> {
    let mut entries = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        match serde_json::from_str::<KnowledgeEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = idx + 1,
                error = %e,
                "Skipping unparseable knowledge line"
            ),
        }
    }
    entries
}

fn merge_and_write(path: &Path, entries: Vec<KnowledgeEntry>) -> Result<AppendOutcome> {
    let mut lines = read_lines(path)?;
    let mut seen: Vec<HashSet<String>> = parse_lines(path, &lines)
        .iter()
        .map(|e| word_set(&e.text))
        .collect();

    let mut outcome = AppendOutcome::default();
    for entry in entries {
        let words = word_set(&entry.text);
        if seen.iter().any(|existing| is_near_duplicate(existing, &words)) {
            outcome.skipped += 1;
            continue;
        }
        let line = serde_json::to_string(&entry)
            .map_err(|e| ReviewError::Other(anyhow::Error::new(e).context("Failed to encode knowledge entry")))?;
        lines.push(line);
        seen.push(words);
        outcome.appended += 1;
    }

    if outcome.appended > 0 {
        write_atomic(path, &lines)?;
    }
    Ok(outcome)
}

fn write_atomic(path: &Path, lines: &[String]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        fs::rename(&tmp, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        ReviewError::io(path, e)
    })
}

/// Lowercased alphanumeric words.
fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn is_near_duplicate(a: &HashSet<String>, b: &HashSet<String>) -> bool {
    if a.is_empty() && b.is_empty() {
        return true;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    union > 0.0 && intersection / union >= NEAR_DUPLICATE_THRESHOLD
}
