use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wfc_common::validate_identifier;

use super::ExecutionContext;
use super::runner::{JobInput, Orchestrator};
use crate::consensus::ConsensusResult;
use crate::errors::{Result, ReviewError};
use crate::jobs::{NewJob, ReviewJob};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_jobs: usize,
    /// Queued plus running jobs accepted before submissions are refused.
    pub max_pending: usize,
    pub job_timeout: Duration,
    /// Age after which a non-terminal job with no live task is failed.
    pub stale_after: Duration,
    pub maintenance_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_pending: 64,
            job_timeout: Duration::from_secs(600),
            stale_after: Duration::from_secs(1800),
            maintenance_interval: Duration::from_secs(300),
        }
    }
}

/// A review request as received from a client.
#[derive(Debug, Clone)]
pub struct ReviewSubmission {
    pub project_id: String,
    pub developer_id: String,
    pub task_id: String,
    pub files: Vec<String>,
    pub diff_content: String,
}

struct Inner {
    ctx: Arc<ExecutionContext>,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    idle: Notify,
    shutdown: CancellationToken,
}

/// Runs orchestrator invocations off the request path.
///
/// `submit` persists a `PENDING` job and returns at once; a spawned task
/// waits for one of `max_concurrent_jobs` permits, runs the job under
/// `job_timeout`, and always leaves it `COMPLETED` or `FAILED`.
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<Inner>,
}

impl BackgroundExecutor {
    pub fn new(ctx: Arc<ExecutionContext>, config: ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
                ctx,
                config,
                pending: AtomicUsize::new(0),
                running: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.inner.ctx
    }

    fn running(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.inner.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of accepted jobs that have not yet reached a terminal state.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> Vec<Uuid> {
        self.running().keys().copied().collect()
    }

    /// Validate, persist as `PENDING`, and schedule. Validation happens before
    /// anything is written or acquired.
    pub async fn submit(&self, submission: ReviewSubmission) -> Result<ReviewJob> {
        let ctx = &self.inner.ctx;
        let project = ctx
            .config
            .project_context(&submission.project_id, &submission.developer_id)?;
        validate_identifier("task_id", &submission.task_id)?;

        if self.inner.shutdown.is_cancelled() {
            return Err(ReviewError::ResourceExhausted {
                resource: "job executor (shutting down)",
                waited: Duration::ZERO,
            });
        }
        let max_pending = self.inner.config.max_pending;
        if self
            .inner
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max_pending).then_some(n + 1))
            .is_err()
        {
            tracing::warn!(max_pending, project_id = %submission.project_id, "Job queue full");
            return Err(ReviewError::ResourceExhausted {
                resource: "job queue",
                waited: Duration::ZERO,
            });
        }

        let job = match ctx
            .store
            .create_job(NewJob {
                project_id: submission.project_id.clone(),
                developer_id: submission.developer_id.clone(),
                task_id: submission.task_id.clone(),
            })
            .await
        {
            Ok(job) => job,
            Err(e) => {
                self.finish_slot();
                return Err(e);
            }
        };

        let token = self.inner.shutdown.child_token();
        self.running().insert(job.job_id, token.clone());

        let input = JobInput {
            job_id: job.job_id,
            project,
            task_id: submission.task_id,
            files: submission.files,
            diff_content: submission.diff_content,
        };
        tracing::info!(
            job_id = %job.job_id,
            project_id = %job.project_id,
            developer_id = %job.developer_id,
            task_id = %job.task_id,
            "Review submitted"
        );

        let executor = self.clone();
        tokio::spawn(async move { executor.drive(input, token).await });
        Ok(job)
    }

    async fn drive(self, input: JobInput, token: CancellationToken) {
        let job_id = input.job_id;

        let outcome = tokio::select! {
            permit = self.inner.permits.clone().acquire_owned() => match permit {
                Ok(_permit) => self.execute(input, &token).await,
                Err(_) => Err(ReviewError::OrchestrationFailure("executor closed".into())),
            },
            _ = token.cancelled() => Err(ReviewError::OrchestrationFailure("cancelled before start".into())),
        };

        match outcome {
            Ok(result) => {
                tracing::debug!(job_id = %job_id, tier = %result.tier, "Job finished");
            }
            Err(e) => self.record_failure(job_id, &e).await,
        }

        self.running().remove(&job_id);
        self.finish_slot();
    }

    async fn execute(&self, input: JobInput, token: &CancellationToken) -> Result<ConsensusResult> {
        let job_timeout = self.inner.config.job_timeout;
        let orchestrator = Orchestrator::new(self.inner.ctx.clone());
        let run_token = token.clone();

        let handle = tokio::spawn(async move {
            tokio::time::timeout(job_timeout, orchestrator.run(&input, &run_token)).await
        });

        match handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_elapsed)) => {
                // Stop reviewer subprocesses that outlived the deadline.
                token.cancel();
                Err(ReviewError::OrchestrationFailure(format!(
                    "timed out after {}s",
                    job_timeout.as_secs_f64()
                )))
            }
            Err(e) if e.is_panic() => {
                Err(ReviewError::OrchestrationFailure("orchestrator panicked".into()))
            }
            Err(_) => Err(ReviewError::OrchestrationFailure("orchestrator task aborted".into())),
        }
    }

    async fn record_failure(&self, job_id: Uuid, error: &ReviewError) {
        let message = error.to_string();
        match self.inner.ctx.store.fail(job_id, message.clone()).await {
            Ok(_) => tracing::warn!(job_id = %job_id, error = %message, "Review failed"),
            Err(ReviewError::InvalidTransition { from, .. }) => {
                tracing::debug!(job_id = %job_id, status = %from, "Job already terminal");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, original = %message, "Failed to record job failure");
            }
        }
    }

    fn finish_slot(&self) {
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
    }

    /// Request cancellation. Returns false if the job has no live task.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.running().get(&job_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(job_id = %job_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Fail non-terminal jobs older than `stale_after` that no task owns.
    pub async fn recover(&self, stale_after: Duration) -> Result<Vec<Uuid>> {
        let recovered = self
            .inner
            .ctx
            .store
            .recover_stale(stale_after, self.active_jobs())
            .await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "Recovered stale jobs");
        }
        Ok(recovered)
    }

    /// Periodic stale-job recovery until `cancel` fires.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let executor = self.clone();
        let interval = executor.inner.config.maintenance_interval;
        let stale_after = executor.inner.config.stale_after;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = executor.recover(stale_after).await {
                            tracing::error!(error = %e, "Stale job recovery failed");
                        }
                    }
                }
            }
        })
    }

    /// Cancel everything in flight and wait (bounded) for tasks to record
    /// their terminal state. Returns true if all finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                tracing::warn!(pending = self.pending(), "Shutdown grace period elapsed");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::{Harness, harness};
    use crate::reviewer::{ReviewRequest, Reviewer, StaticReviewer};
    use async_trait::async_trait;
    use wfc_common::{Finding, JobStatus, ReviewerRole};

    /// Blocks until cancelled.
    struct HangingReviewer;

    #[async_trait]
    impl Reviewer for HangingReviewer {
        async fn run(&self, _: &ReviewRequest, role: ReviewerRole, cancel: &CancellationToken) -> Result<Vec<Finding>> {
            cancel.cancelled().await;
            Err(ReviewError::OrchestrationFailure(format!("{role} pass cancelled")))
        }
    }

    struct ThrowingReviewer;

    #[async_trait]
    impl Reviewer for ThrowingReviewer {
        async fn run(&self, _: &ReviewRequest, _: ReviewerRole, _: &CancellationToken) -> Result<Vec<Finding>> {
            Err(ReviewError::OrchestrationFailure("reviewer exploded".into()))
        }
    }

    fn submission(project_id: &str, task_id: &str) -> ReviewSubmission {
        ReviewSubmission {
            project_id: project_id.into(),
            developer_id: "alice".into(),
            task_id: task_id.into(),
            files: vec!["src/lib.rs".into()],
            diff_content: "+x".into(),
        }
    }

    async fn wait_terminal(h: &Harness, job_id: Uuid) -> ReviewJob {
        for _ in 0..250 {
            if let Some(job) = h.ctx.store.get_job(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    async fn wait_idle(executor: &BackgroundExecutor) {
        for _ in 0..250 {
            if executor.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("executor never went idle");
    }

    #[tokio::test]
    async fn submitted_job_completes() {
        let h = harness(Arc::new(StaticReviewer::new()), 2);
        let executor = BackgroundExecutor::new(h.ctx.clone(), ExecutorConfig::default());

        let job = executor.submit(submission("p1", "T")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = wait_terminal(&h, job.job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.map(|r| r.reviewers_run), Some(5));
        wait_idle(&executor).await;
        assert!(executor.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn throwing_reviewer_fails_job_and_releases_slot_once() {
        let h = harness(Arc::new(ThrowingReviewer), 1);
        let executor = BackgroundExecutor::new(h.ctx.clone(), ExecutorConfig::default());

        let job = executor.submit(submission("p1", "T")).await.unwrap();
        let failed = wait_terminal(&h, job.job_id).await;

        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.started_at.is_some(), "job should have passed through in_progress");
        assert!(failed.error.unwrap_or_default().contains("reviewer exploded"));
        wait_idle(&executor).await;
        assert_eq!(h.provisioner.destroy_count(), 1);
        assert_eq!(h.ctx.pool.stats().active, 0);
    }

    #[tokio::test]
    async fn hung_job_times_out() {
        let h = harness(Arc::new(HangingReviewer), 1);
        let config = ExecutorConfig {
            job_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let executor = BackgroundExecutor::new(h.ctx.clone(), config);

        let job = executor.submit(submission("p1", "T")).await.unwrap();
        let failed = wait_terminal(&h, job.job_id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap_or_default().contains("timed out"));

        wait_idle(&executor).await;
        // The dropped lease releases in the background.
        for _ in 0..100 {
            if h.ctx.pool.stats().active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.ctx.pool.stats().active, 0);
        assert_eq!(h.provisioner.destroy_count(), 1);
    }

    #[tokio::test]
    async fn cancel_fails_running_job() {
        let h = harness(Arc::new(HangingReviewer), 1);
        let executor = BackgroundExecutor::new(h.ctx.clone(), ExecutorConfig::default());

        let job = executor.submit(submission("p1", "T")).await.unwrap();
        for _ in 0..100 {
            let current = h.ctx.store.get_job(job.job_id).await.unwrap().unwrap();
            if current.status == JobStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(executor.cancel(job.job_id));

        let failed = wait_terminal(&h, job.job_id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap_or_default().contains("cancelled"));
        wait_idle(&executor).await;
        assert!(!executor.cancel(job.job_id));
        assert_eq!(h.ctx.pool.stats().active, 0);
    }

    #[tokio::test]
    async fn queue_limit_applies_backpressure() {
        let h = harness(Arc::new(HangingReviewer), 2);
        let config = ExecutorConfig {
            max_pending: 1,
            ..Default::default()
        };
        let executor = BackgroundExecutor::new(h.ctx.clone(), config);

        executor.submit(submission("p1", "a")).await.unwrap();
        let err = executor.submit(submission("p1", "b")).await.unwrap_err();
        assert!(matches!(err, ReviewError::ResourceExhausted { resource: "job queue", .. }));

        assert!(executor.shutdown(Duration::from_secs(5)).await);
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test]
    async fn invalid_identifiers_never_reach_the_store() {
        let h = harness(Arc::new(StaticReviewer::new()), 1);
        let executor = BackgroundExecutor::new(h.ctx.clone(), ExecutorConfig::default());

        for bad in [submission("../etc", "T"), submission("p1", "a/b"), submission("p1", "")] {
            let err = executor.submit(bad).await.unwrap_err();
            assert!(err.is_fatal(), "{err}");
        }
        assert_eq!(executor.pending(), 0);
        assert_eq!(h.provisioner.create_count(), 0);
    }

    #[tokio::test]
    async fn recovery_skips_live_jobs() {
        let h = harness(Arc::new(HangingReviewer), 1);
        let executor = BackgroundExecutor::new(h.ctx.clone(), ExecutorConfig::default());

        let orphan = h
            .ctx
            .store
            .create_job(NewJob {
                project_id: "p1".into(),
                developer_id: "bob".into(),
                task_id: "old".into(),
            })
            .await
            .unwrap();
        let live = executor.submit(submission("p1", "T")).await.unwrap();

        let recovered = executor.recover(Duration::ZERO).await.unwrap();
        assert_eq!(recovered, vec![orphan.job_id]);
        let live_now = h.ctx.store.get_job(live.job_id).await.unwrap().unwrap();
        assert!(!live_now.status.is_terminal());

        executor.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn many_jobs_all_terminate() {
        let h = harness(Arc::new(StaticReviewer::new()), 2);
        let config = ExecutorConfig {
            max_concurrent_jobs: 3,
            ..Default::default()
        };
        let executor = BackgroundExecutor::new(h.ctx.clone(), config);

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(executor.submit(submission(&format!("p{i}"), "T")).await.unwrap().job_id);
        }
        for id in ids {
            assert_eq!(wait_terminal(&h, id).await.status, JobStatus::Completed);
        }
        assert_eq!(h.provisioner.create_count(), 6);
    }
}
