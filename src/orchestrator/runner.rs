use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wfc_common::{KnowledgeEntry, ProjectContext, ReviewerRole};

use super::ExecutionContext;
use crate::consensus::{ConsensusResult, ReviewerPass};
use crate::errors::{Result, ReviewError};
use crate::pool::WorktreeLease;
use crate::reviewer::ReviewRequest;

/// One validated job as handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub job_id: Uuid,
    pub project: ProjectContext,
    pub task_id: String,
    pub files: Vec<String>,
    pub diff_content: String,
}

enum PassOutcome {
    Ran(ReviewerPass),
    Skipped(ReviewerRole),
}

fn cancelled() -> ReviewError {
    ReviewError::OrchestrationFailure("cancelled".to_string())
}

/// Drives one job from slot acquisition to `COMPLETED`.
///
/// Any error returned means the job must be failed by the caller; the slot
/// and unused rate-limit tokens have already been returned by then.
pub struct Orchestrator {
    ctx: Arc<ExecutionContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, input: &JobInput, cancel: &CancellationToken) -> Result<ConsensusResult> {
        let project = &input.project;
        let config = &self.ctx.config;
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let lease = tokio::select! {
            lease = self.ctx.pool.acquire(
                project.project_id(),
                &input.task_id,
                project.repo_path(),
                config.worktree_timeout,
            ) => lease?,
            _ = cancel.cancelled() => return Err(cancelled()),
        };

        let outcome = self.run_in_slot(input, &lease, cancel).await;
        lease.release().await;
        outcome
    }

    async fn run_in_slot(
        &self,
        input: &JobInput,
        lease: &WorktreeLease,
        cancel: &CancellationToken,
    ) -> Result<ConsensusResult> {
        let project = &input.project;
        if !lease.path().starts_with(project.worktree_root()) {
            return Err(ReviewError::PathTraversal {
                requested: lease.path().to_path_buf(),
                root: project.worktree_root().to_path_buf(),
            });
        }
        for dir in [project.output_dir(), project.metrics_dir()] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ReviewError::io(dir, e))?;
        }

        let reserved = self.reserve_tokens(cancel).await?;

        if let Err(e) = self.ctx.store.mark_in_progress(input.job_id).await {
            self.ctx.bucket.refund(reserved);
            return Err(e);
        }
        tracing::info!(
            job_id = %input.job_id,
            project_id = %input.project.project_id(),
            task_id = %input.task_id,
            worktree = %lease.path().display(),
            "Review started"
        );

        let request = ReviewRequest {
            job_id: input.job_id,
            project_id: input.project.project_id().to_string(),
            developer_id: input.project.developer_id().to_string(),
            task_id: input.task_id.clone(),
            files: input.files.clone(),
            diff_content: input.diff_content.clone(),
            worktree_path: lease.path().to_path_buf(),
            output_dir: input.project.output_dir().to_path_buf(),
            metrics_dir: input.project.metrics_dir().to_path_buf(),
        };
        let outcomes = self.fan_out(request, cancel).await;

        let mut passes = Vec::with_capacity(outcomes.len());
        let mut unused = 0u32;
        for outcome in outcomes {
            match outcome {
                PassOutcome::Ran(pass) => passes.push(pass),
                PassOutcome::Skipped(_) => unused += self.ctx.config.tokens_per_pass,
            }
        }
        self.ctx.bucket.refund(unused);

        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        if !passes.is_empty() && passes.iter().all(ReviewerPass::is_failed) {
            let reasons: Vec<String> = passes
                .iter()
                .filter_map(|p| p.error.as_ref().map(|e| format!("{}: {}", p.reviewer_id, e)))
                .collect();
            return Err(ReviewError::OrchestrationFailure(format!(
                "all {} reviewer passes failed ({})",
                passes.len(),
                reasons.join("; ")
            )));
        }

        let mut result = self.ctx.scorer.score(&input.task_id, &passes);
        result.knowledge_recorded = self.record_knowledge(input, &result).await;

        self.ctx.store.complete(input.job_id, result.clone()).await?;
        tracing::info!(
            job_id = %input.job_id,
            cs_score = result.cs_score,
            tier = %result.tier,
            findings = result.findings.len(),
            "Review completed"
        );
        Ok(result)
    }

    /// Reserve tokens for every pass up front, in role order, so a job never
    /// starts reviewing with only part of its budget.
    async fn reserve_tokens(&self, cancel: &CancellationToken) -> Result<u32> {
        let config = &self.ctx.config;
        let mut reserved = 0u32;
        for role in &config.roles {
            let acquired = tokio::select! {
                r = self.ctx.bucket.acquire_for_role(
                    *role,
                    config.tokens_per_pass,
                    Some(config.rate_limit_timeout),
                ) => r,
                _ = cancel.cancelled() => Err(cancelled()),
            };
            if let Err(e) = acquired {
                self.ctx.bucket.refund(reserved);
                return Err(e);
            }
            reserved += config.tokens_per_pass;
        }
        Ok(reserved)
    }

    async fn fan_out(&self, request: ReviewRequest, cancel: &CancellationToken) -> Vec<PassOutcome> {
        let config = &self.ctx.config;
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_reviewers.max(1)));
        let request = Arc::new(request);
        let mut set = JoinSet::new();

        for role in config.roles.iter().copied() {
            let semaphore = semaphore.clone();
            let reviewer = self.ctx.reviewer.clone();
            let request = request.clone();
            let cancel = cancel.clone();

            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return PassOutcome::Skipped(role);
                };
                if cancel.is_cancelled() {
                    return PassOutcome::Skipped(role);
                }

                let job_id = request.job_id;
                // A panicking reviewer surfaces as a JoinError instead of
                // taking the whole job down.
                let pass = tokio::spawn(async move { reviewer.run(&request, role, &cancel).await });
                match pass.await {
                    Ok(Ok(findings)) => {
                        let findings = findings
                            .into_iter()
                            .map(|f| f.attributed_to(role.as_str()))
                            .collect();
                        PassOutcome::Ran(ReviewerPass::ok(role.as_str(), findings))
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(job_id = %job_id, role = %role, error = %e, "Reviewer pass failed");
                        PassOutcome::Ran(ReviewerPass::failed(role.as_str(), e.to_string()))
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, role = %role, error = %e, "Reviewer pass panicked");
                        PassOutcome::Ran(ReviewerPass::failed(role.as_str(), format!("{role} pass panicked")))
                    }
                }
            });
        }

        let mut outcomes = Vec::with_capacity(config.roles.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "Reviewer task aborted"),
            }
        }
        outcomes
    }

    /// Append high-risk findings to each reporting role's log. Returns false
    /// if any append failed; the review itself still succeeds.
    async fn record_knowledge(&self, input: &JobInput, result: &ConsensusResult) -> bool {
        let mut by_target: BTreeMap<String, Vec<KnowledgeEntry>> = BTreeMap::new();
        for finding in result
            .findings
            .iter()
            .filter(|f| f.risk >= self.ctx.config.knowledge_min_risk)
        {
            let text = format!("{} in {}: {}", finding.category, finding.file_path, finding.description);
            for reviewer in &finding.reviewers {
                let Some(role) = ReviewerRole::from_reviewer_id(reviewer) else {
                    continue;
                };
                by_target
                    .entry(format!("reviewers/{}.jsonl", role.as_str()))
                    .or_default()
                    .push(KnowledgeEntry::new(
                        &text,
                        &finding.category,
                        reviewer,
                        input.project.developer_id(),
                    ));
            }
        }

        let mut recorded = true;
        for (target, entries) in by_target {
            match self.ctx.knowledge.append(entries, &target).await {
                Ok(outcome) => tracing::debug!(
                    job_id = %input.job_id,
                    knowledge_target = %target,
                    appended = outcome.appended,
                    skipped = outcome.skipped,
                    "Knowledge recorded"
                ),
                Err(e) => {
                    recorded = false;
                    tracing::warn!(
                        job_id = %input.job_id,
                        knowledge_target = %target,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Knowledge not recorded"
                    );
                }
            }
        }
        recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use crate::knowledge::{KnowledgeStore, lock_path};
    use crate::orchestrator::test_support::harness;
    use crate::reviewer::{Reviewer, StaticReviewer};
    use async_trait::async_trait;
    use wfc_common::{Finding, JobStatus};

    struct FailingReviewer;

    #[async_trait]
    impl Reviewer for FailingReviewer {
        async fn run(&self, _: &ReviewRequest, role: ReviewerRole, _: &CancellationToken) -> Result<Vec<Finding>> {
            Err(ReviewError::OrchestrationFailure(format!("{role} backend unavailable")))
        }
    }

    /// Security pass panics, everyone else finds nothing.
    struct PanickingSecurity;

    #[async_trait]
    impl Reviewer for PanickingSecurity {
        async fn run(&self, _: &ReviewRequest, role: ReviewerRole, _: &CancellationToken) -> Result<Vec<Finding>> {
            if role == ReviewerRole::Security {
                panic!("reviewer bug");
            }
            Ok(Vec::new())
        }
    }

    async fn input_for(ctx: &ExecutionContext, project_id: &str, task_id: &str) -> JobInput {
        let job = ctx
            .store
            .create_job(NewJob {
                project_id: project_id.into(),
                developer_id: "alice".into(),
                task_id: task_id.into(),
            })
            .await
            .unwrap();
        JobInput {
            job_id: job.job_id,
            project: ctx.config.project_context(project_id, "alice").unwrap(),
            task_id: task_id.into(),
            files: vec!["src/lib.rs".into()],
            diff_content: "+unsafe { }".into(),
        }
    }

    #[tokio::test]
    async fn completes_and_records_knowledge() {
        let finding = Finding::new("security", "injection", "src/db.rs", 10, "Unescaped query", 9.0, 9.0).unwrap();
        let reviewer = StaticReviewer::new().with_findings(ReviewerRole::Security, vec![finding]);
        let h = harness(Arc::new(reviewer), 2);
        let input = input_for(&h.ctx, "p1", "T").await;

        let result = Orchestrator::new(h.ctx.clone())
            .run(&input, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.reviewers_run, 5);
        assert!(result.knowledge_recorded);

        let job = h.ctx.store.get_job(input.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.as_ref().map(|r| r.findings.len()), Some(1));

        let lessons = h.ctx.knowledge.read("reviewers/security.jsonl").await.unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].developer_id, "alice");

        assert!(input.project.output_dir().is_dir());
        assert!(input.project.output_dir().starts_with(h.ctx.config.data_root.join("output")));
        assert!(input.project.metrics_dir().is_dir());

        assert_eq!(h.ctx.pool.stats().active, 0);
        assert_eq!(h.provisioner.destroy_count(), 1);
        assert_eq!(h.ctx.bucket.available().round() as u32, 95);
    }

    #[tokio::test]
    async fn every_pass_failing_fails_the_job_and_releases_once() {
        let h = harness(Arc::new(FailingReviewer), 1);
        let input = input_for(&h.ctx, "p1", "T").await;

        let err = Orchestrator::new(h.ctx.clone())
            .run(&input, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("backend unavailable"));

        // The caller records the failure; the job already went through IN_PROGRESS.
        let failed = h.ctx.store.fail(input.job_id, err.to_string()).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.started_at.is_some());
        assert!(failed.error.is_some());

        assert_eq!(h.provisioner.destroy_count(), 1);
        assert_eq!(h.ctx.pool.stats().active, 0);
    }

    #[tokio::test]
    async fn panicking_pass_counts_as_empty() {
        let h = harness(Arc::new(PanickingSecurity), 1);
        let input = input_for(&h.ctx, "p1", "T").await;

        let result = Orchestrator::new(h.ctx.clone())
            .run(&input, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.reviewers_run, 5);
        let security = result.reviewers.iter().find(|r| r.reviewer_id == "security").unwrap();
        assert!(security.error.as_deref().unwrap_or_default().contains("panicked"));
        assert_eq!(h.provisioner.destroy_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let h = harness(Arc::new(StaticReviewer::new()), 1);
        let input = input_for(&h.ctx, "p1", "T").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Orchestrator::new(h.ctx.clone()).run(&input, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(h.provisioner.create_count(), 0);
        assert_eq!(h.ctx.bucket.available().round() as u32, 100);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_returns_partial_reservation() {
        let h = harness(Arc::new(StaticReviewer::new()), 1);
        // Leave room for three of the five passes and no refill.
        let ctx = Arc::new(ExecutionContext {
            pool: h.ctx.pool.clone(),
            bucket: crate::ratelimit::TokenBucket::new(3, 0.0),
            knowledge: h.ctx.knowledge.clone(),
            store: h.ctx.store.clone(),
            reviewer: h.ctx.reviewer.clone(),
            scorer: h.ctx.scorer.clone(),
            config: {
                let mut c = h.ctx.config.clone();
                c.rate_limit_timeout = std::time::Duration::from_millis(50);
                c
            },
        });
        let input = input_for(&ctx, "p1", "T").await;

        let err = Orchestrator::new(ctx.clone())
            .run(&input, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::RateLimitExceeded { .. }));
        assert_eq!(ctx.bucket.available().round() as u32, 3);
        assert_eq!(ctx.pool.stats().active, 0);
        let job = ctx.store.get_job(input.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn findings_are_attributed_to_their_pass() {
        let claimed = vec![
            Finding::new("security-a", "rce", "api.rs", 1, "Shell injection", 9.5, 9.5).unwrap(),
            Finding::new("reliability", "rce", "api.rs", 1, "Shell injection", 9.5, 9.5).unwrap(),
        ];
        let reviewer = StaticReviewer::new().with_findings(ReviewerRole::Security, claimed);
        let h = harness(Arc::new(reviewer), 1);
        let input = input_for(&h.ctx, "p1", "T").await;

        let result = Orchestrator::new(h.ctx.clone())
            .run(&input, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].k, 1);
        assert_eq!(result.findings[0].reviewers, vec!["security"]);
        assert!(result.cs_score <= 10.0);
        assert!(result.minority_protection.is_some());

        let reliability = h.ctx.knowledge.read("reviewers/reliability.jsonl").await.unwrap();
        assert!(reliability.is_empty());
    }

    #[tokio::test]
    async fn knowledge_lock_timeout_still_completes() {
        use fs2::FileExt;

        let finding = Finding::new("security", "injection", "src/db.rs", 10, "Unescaped query", 9.0, 9.0).unwrap();
        let reviewer = StaticReviewer::new().with_findings(ReviewerRole::Security, vec![finding]);
        let h = harness(Arc::new(reviewer), 1);
        let knowledge = KnowledgeStore::with_lock_timeouts(
            h.dir.path().join("knowledge"),
            std::time::Duration::from_millis(30),
            std::time::Duration::from_millis(120),
        )
        .unwrap();
        let ctx = Arc::new(ExecutionContext {
            pool: h.ctx.pool.clone(),
            bucket: crate::ratelimit::TokenBucket::new(100, 0.0),
            knowledge: knowledge.clone(),
            store: h.ctx.store.clone(),
            reviewer: h.ctx.reviewer.clone(),
            scorer: h.ctx.scorer.clone(),
            config: h.ctx.config.clone(),
        });

        // Another process holding the security log's sidecar lock.
        let target = knowledge.resolve("reviewers/security.jsonl").unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        let foreign = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(&target))
            .unwrap();
        foreign.lock_exclusive().unwrap();

        let input = input_for(&ctx, "p1", "T").await;
        let result = Orchestrator::new(ctx.clone())
            .run(&input, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.knowledge_recorded);
        assert_eq!(result.findings.len(), 1);

        let job = ctx.store.get_job(input.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.map(|r| r.knowledge_recorded), Some(false));
        assert_eq!(ctx.pool.stats().active, 0);
        assert_eq!(h.provisioner.destroy_count(), 1);

        FileExt::unlock(&foreign).unwrap();
        assert!(!target.exists());
    }
}
