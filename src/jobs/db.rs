use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use uuid::Uuid;
use wfc_common::JobStatus;

use super::models::*;
use crate::consensus::ConsensusResult;
use crate::errors::{Result, ReviewError};

/// Async-safe handle to the job database.
///
/// Wraps `JobDb` behind `Arc<Mutex>` and runs every call on tokio's blocking
/// pool, so SQLite I/O never ties up async worker threads.
#[derive(Clone)]
pub struct JobStore {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl JobStore {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(JobDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(JobDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| ReviewError::Database(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| ReviewError::Database(anyhow::Error::new(e).context("DB task panicked")))?
    }

    pub async fn create_job(&self, job: NewJob) -> Result<ReviewJob> {
        self.call(move |db| db.create_job(&job)).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<ReviewJob>> {
        self.call(move |db| db.get_job(job_id)).await
    }

    pub async fn mark_in_progress(&self, job_id: Uuid) -> Result<ReviewJob> {
        self.call(move |db| db.mark_in_progress(job_id)).await
    }

    pub async fn complete(&self, job_id: Uuid, result: ConsensusResult) -> Result<ReviewJob> {
        self.call(move |db| db.complete(job_id, &result)).await
    }

    pub async fn fail(&self, job_id: Uuid, error: impl Into<String>) -> Result<ReviewJob> {
        let error = error.into();
        self.call(move |db| db.fail(job_id, &error)).await
    }

    pub async fn recover_stale(&self, older_than: Duration, active: Vec<Uuid>) -> Result<Vec<Uuid>> {
        self.call(move |db| db.recover_stale(older_than, &active)).await
    }

    pub async fn register_project(&self, record: ProjectRecord) -> Result<()> {
        self.call(move |db| db.register_project(&record)).await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>> {
        let project_id = project_id.to_string();
        self.call(move |db| db.get_project(&project_id)).await
    }
}

pub struct JobDb {
    conn: Connection,
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in job store: {}", s))
        .map_err(ReviewError::Database)
}

const JOB_COLUMNS: &str = "job_id, project_id, developer_id, task_id, status, submitted_at, started_at, completed_at, result_json, error";

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ReviewError::io(parent, e))?;
        }
        let conn = Connection::open(path)
            .context("Failed to open SQLite database")
            .map_err(ReviewError::Database)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")
            .map_err(ReviewError::Database)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS projects (
                project_id TEXT PRIMARY KEY,
                salt TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                developer_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                result_json TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
            ",
        )?;
        Ok(())
    }

    pub fn create_job(&self, job: &NewJob) -> Result<ReviewJob> {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO jobs (job_id, project_id, developer_id, task_id, status, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job_id.to_string(),
                job.project_id,
                job.developer_id,
                job.task_id,
                JobStatus::Pending.as_str(),
                timestamp(now),
            ],
        )?;
        self.get_job(job_id)?
            .ok_or(ReviewError::JobNotFound { job_id })
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Option<ReviewJob>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id.to_string()],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn mark_in_progress(&self, job_id: Uuid) -> Result<ReviewJob> {
        self.transition(job_id, JobStatus::InProgress, None, None)
    }

    pub fn complete(&self, job_id: Uuid, result: &ConsensusResult) -> Result<ReviewJob> {
        let json = serde_json::to_string(result)
            .context("Failed to encode consensus result")
            .map_err(ReviewError::Database)?;
        self.transition(job_id, JobStatus::Completed, Some(&json), None)
    }

    pub fn fail(&self, job_id: Uuid, error: &str) -> Result<ReviewJob> {
        self.transition(job_id, JobStatus::Failed, None, Some(error))
    }

    /// Apply one edge of the state machine. The UPDATE is guarded on the
    /// current status, so a concurrent writer can never push a job out of a
    /// terminal state.
    fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        result_json: Option<&str>,
        error: Option<&str>,
    ) -> Result<ReviewJob> {
        let tx = self.conn.unchecked_transaction()?;
        let id = job_id.to_string();

        let current: Option<String> = tx
            .query_row("SELECT status FROM jobs WHERE job_id = ?1", params![id], |row| row.get(0))
            .optional()?;
        let from = match current {
            Some(s) => JobStatus::from_str(&s)
                .map_err(|e| ReviewError::Database(anyhow::anyhow!(e)))?,
            None => return Err(ReviewError::JobNotFound { job_id }),
        };
        if !from.can_transition_to(to) {
            return Err(ReviewError::InvalidTransition { job_id, from, to });
        }

        let now = timestamp(Utc::now());
        let updated = match to {
            JobStatus::InProgress => tx.execute(
                "UPDATE jobs SET status = ?1, started_at = ?2 WHERE job_id = ?3 AND status = ?4",
                params![to.as_str(), now, id, from.as_str()],
            )?,
            _ => tx.execute(
                "UPDATE jobs SET status = ?1, completed_at = ?2, result_json = ?3, error = ?4
                 WHERE job_id = ?5 AND status = ?6",
                params![to.as_str(), now, result_json, error, id, from.as_str()],
            )?,
        };
        if updated != 1 {
            return Err(ReviewError::InvalidTransition { job_id, from, to });
        }
        tx.commit()?;

        tracing::debug!(job_id = %job_id, from = %from, to = %to, "Job transitioned");
        self.get_job(job_id)?
            .ok_or(ReviewError::JobNotFound { job_id })
    }

    /// Fail every job that has sat in `in_progress` (or never left `pending`)
    /// for longer than `older_than`, except those listed in `active`.
    /// Returns the ids that were failed.
    pub fn recover_stale(&self, older_than: Duration, active: &[Uuid]) -> Result<Vec<Uuid>> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let candidates: Vec<(String, String, Option<String>, String)> = {
            let mut stmt = self.conn.prepare(
                "SELECT job_id, status, started_at, submitted_at FROM jobs
                 WHERE status IN ('pending', 'in_progress')",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut recovered = Vec::new();
        for (id, status, started_at, submitted_at) in candidates {
            let since = match started_at.as_deref() {
                Some(s) if status == JobStatus::InProgress.as_str() => parse_timestamp(s)?,
                _ => parse_timestamp(&submitted_at)?,
            };
            if since > cutoff {
                continue;
            }
            let job_id = Uuid::parse_str(&id)
                .context("Invalid job id in job store")
                .map_err(ReviewError::Database)?;
            if active.contains(&job_id) {
                continue;
            }
            let message = format!("Recovered stale job (stuck in {} since {})", status, since);
            match self.fail(job_id, &message) {
                Ok(_) => {
                    tracing::warn!(job_id = %job_id, status = %status, "Failed stale job during recovery");
                    recovered.push(job_id);
                }
                Err(ReviewError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    pub fn register_project(&self, record: &ProjectRecord) -> Result<()> {
        let inserted = self.conn.execute(
            "INSERT INTO projects (project_id, salt, token_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.project_id,
                record.salt,
                record.token_hash,
                timestamp(record.created_at)
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(ReviewError::DuplicateProject {
                    project_id: record.project_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>> {
        let row: Option<(String, String, String, String)> = self
            .conn
            .query_row(
                "SELECT project_id, salt, token_hash, created_at FROM projects WHERE project_id = ?1",
                params![project_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(|(project_id, salt, token_hash, created_at)| {
            Ok(ProjectRecord {
                project_id,
                salt,
                token_hash,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }
}

/// Intermediate row struct for jobs.
struct JobRow {
    job_id: String,
    project_id: String,
    developer_id: String,
    task_id: String,
    status: String,
    submitted_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result_json: Option<String>,
    error: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            project_id: row.get(1)?,
            developer_id: row.get(2)?,
            task_id: row.get(3)?,
            status: row.get(4)?,
            submitted_at: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            result_json: row.get(8)?,
            error: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<ReviewJob> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| ReviewError::Database(anyhow::anyhow!(e)))?;
        let job_id = Uuid::parse_str(&self.job_id)
            .context("Failed to parse job id")
            .map_err(ReviewError::Database)?;
        let result = self
            .result_json
            .as_deref()
            .map(|json| serde_json::from_str::<ConsensusResult>(json))
            .transpose()
            .context("Failed to parse stored consensus result")
            .map_err(ReviewError::Database)?;

        Ok(ReviewJob {
            job_id,
            project_id: self.project_id,
            developer_id: self.developer_id,
            task_id: self.task_id,
            status,
            submitted_at: parse_timestamp(&self.submitted_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            result,
            error: self.error,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusScorer, ReviewerPass};

    fn new_job(db: &JobDb) -> Result<ReviewJob> {
        db.create_job(&NewJob {
            project_id: "p1".into(),
            developer_id: "alice".into(),
            task_id: "T".into(),
        })
    }

    fn empty_result() -> ConsensusResult {
        ConsensusScorer::default().score("T", &[ReviewerPass::ok("security", vec![])])
    }

    #[test]
    fn test_create_job_starts_pending() -> Result<()> {
        let db = JobDb::new_in_memory()?;
        let job = new_job(&db)?;
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.result.is_none());

        let fetched = db.get_job(job.job_id)?.expect("job should exist");
        assert_eq!(fetched, job);
        Ok(())
    }

    #[test]
    fn test_happy_path_transitions() -> Result<()> {
        let db = JobDb::new_in_memory()?;
        let job = new_job(&db)?;

        let running = db.mark_in_progress(job.job_id)?;
        assert_eq!(running.status, JobStatus::InProgress);
        assert!(running.started_at.is_some());

        let done = db.complete(job.job_id, &empty_result())?;
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.result.as_ref().map(|r| r.reviewers_run), Some(1));
        Ok(())
    }

    #[test]
    fn test_terminal_state_is_final() -> Result<()> {
        let db = JobDb::new_in_memory()?;
        let job = new_job(&db)?;
        db.mark_in_progress(job.job_id)?;
        let done = db.complete(job.job_id, &empty_result())?;

        let again = db.complete(job.job_id, &empty_result()).unwrap_err();
        assert!(matches!(
            again,
            ReviewError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Completed,
                ..
            }
        ));
        assert!(db.fail(job.job_id, "late failure").is_err());
        assert!(db.mark_in_progress(job.job_id).is_err());

        assert_eq!(db.get_job(job.job_id)?.expect("job should exist"), done);
        Ok(())
    }

    #[test]
    fn test_pending_can_fail_directly() -> Result<()> {
        let db = JobDb::new_in_memory()?;
        let job = new_job(&db)?;
        let failed = db.fail(job.job_id, "worktree pool exhausted")?;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("worktree pool exhausted"));
        assert!(failed.started_at.is_none());
        Ok(())
    }

    #[test]
    fn test_pending_cannot_complete() -> Result<()> {
        let db = JobDb::new_in_memory()?;
        let job = new_job(&db)?;
        assert!(db.complete(job.job_id, &empty_result()).is_err());
        assert_eq!(db.get_job(job.job_id)?.map(|j| j.status), Some(JobStatus::Pending));
        Ok(())
    }

    #[test]
    fn test_unknown_job() -> Result<()> {
        let db = JobDb::new_in_memory()?;
        assert!(db.get_job(Uuid::new_v4())?.is_none());
        assert!(matches!(
            db.mark_in_progress(Uuid::new_v4()),
            Err(ReviewError::JobNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_recover_stale_fails_old_jobs_only() -> Result<()> {
        let db = JobDb::new_in_memory()?;
        let stuck = new_job(&db)?;
        db.mark_in_progress(stuck.job_id)?;
        let finished = new_job(&db)?;
        db.fail(finished.job_id, "boom")?;

        // Nothing is older than an hour yet.
        assert!(db.recover_stale(Duration::from_secs(3600), &[])?.is_empty());

        let old = timestamp(Utc::now() - chrono::Duration::hours(2));
        db.conn.execute(
            "UPDATE jobs SET started_at = ?1 WHERE job_id = ?2",
            params![old, stuck.job_id.to_string()],
        )?;
        // Still owned by a live executor task.
        assert!(db.recover_stale(Duration::from_secs(3600), &[stuck.job_id])?.is_empty());

        let recovered = db.recover_stale(Duration::from_secs(3600), &[])?;
        assert_eq!(recovered, vec![stuck.job_id]);

        let job = db.get_job(stuck.job_id)?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap_or_default().contains("stale"));
        assert_eq!(
            db.get_job(finished.job_id)?.and_then(|j| j.error).as_deref(),
            Some("boom")
        );
        Ok(())
    }

    #[test]
    fn test_register_project_rejects_duplicates() -> Result<()> {
        let db = JobDb::new_in_memory()?;
        let record = ProjectRecord {
            project_id: "p1".into(),
            salt: "00".into(),
            token_hash: "ab".into(),
            created_at: Utc::now(),
        };
        db.register_project(&record)?;
        assert!(matches!(
            db.register_project(&record),
            Err(ReviewError::DuplicateProject { .. })
        ));
        let stored = db.get_project("p1")?.expect("project should exist");
        assert_eq!(stored.token_hash, "ab");
        assert!(db.get_project("p2")?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_store_handle_runs_off_the_runtime() -> Result<()> {
        let store = JobStore::in_memory()?;
        let job = store
            .create_job(NewJob {
                project_id: "p1".into(),
                developer_id: "dev".into(),
                task_id: "T".into(),
            })
            .await?;
        store.mark_in_progress(job.job_id).await?;
        let failed = store.fail(job.job_id, "reviewer crashed").await?;
        assert_eq!(failed.status, JobStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_file_database_persists() -> Result<()> {
        let dir = tempfile::TempDir::new().map_err(|e| ReviewError::io("tempdir", e))?;
        let path = dir.path().join("nested/jobs.db");
        let id = {
            let db = JobDb::new(&path)?;
            new_job(&db)?.job_id
        };
        let reopened = JobDb::new(&path)?;
        assert!(reopened.get_job(id)?.is_some());
        Ok(())
    }
}
