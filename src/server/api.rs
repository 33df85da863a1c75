use std::path::{Component, Path as FsPath};
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wfc_common::{JobStatus, ValidationError, validate_identifier};

use super::auth::{AuthenticatedProject, check_admin, issue_credential};
use crate::consensus::{Decision, MergedFinding, ReviewerSummary, Tier};
use crate::errors::ReviewError;
use crate::jobs::ReviewJob;
use crate::orchestrator::{BackgroundExecutor, ReviewSubmission};

pub const MAX_DIFF_BYTES: usize = 1024 * 1024;
pub const MAX_FILES: usize = 1000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub executor: BackgroundExecutor,
    pub admin_token: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitReviewRequest {
    pub project_id: String,
    pub developer_id: String,
    pub task_id: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub diff_content: String,
}

impl SubmitReviewRequest {
    /// Size and shape checks that do not need any shared state.
    fn validate(&self) -> Result<(), ValidationError> {
        if self.diff_content.len() > MAX_DIFF_BYTES {
            return Err(ValidationError::TooLarge {
                field: "diff_content",
                size: self.diff_content.len(),
                max: MAX_DIFF_BYTES,
            });
        }
        if self.files.len() > MAX_FILES {
            return Err(ValidationError::TooLarge {
                field: "files",
                size: self.files.len(),
                max: MAX_FILES,
            });
        }
        for file in &self.files {
            let path = FsPath::new(file);
            let safe = !file.is_empty()
                && path
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !safe {
                return Err(ValidationError::InvalidPath {
                    field: "files",
                    path: file.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitReviewResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterProjectRequest {
    pub project_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterProjectResponse {
    pub project_id: String,
    pub token: String,
}

/// Client view of a job: the record flattened with its consensus result.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub project_id: String,
    pub developer_id: String,
    pub task_id: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub consensus_score: Option<f64>,
    pub tier: Option<Tier>,
    pub decision: Option<Decision>,
    pub minority_protection: Option<String>,
    pub findings: Vec<MergedFinding>,
    pub reviewers: Vec<ReviewerSummary>,
    pub error: Option<String>,
}

impl From<ReviewJob> for JobView {
    fn from(job: ReviewJob) -> Self {
        let (consensus_score, tier, decision, minority_protection, findings, reviewers) = match job.result {
            Some(r) => (
                Some(r.cs_score),
                Some(r.tier),
                Some(r.decision),
                r.minority_protection,
                r.findings,
                r.reviewers,
            ),
            None => (None, None, None, None, Vec::new(), Vec::new()),
        };
        Self {
            job_id: job.job_id,
            project_id: job.project_id,
            developer_id: job.developer_id,
            task_id: job.task_id,
            status: job.status,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            consensus_score,
            tier,
            decision,
            minority_protection,
            findings,
            reviewers,
            error: job.error,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(pub ReviewError);

impl From<ReviewError> for ApiError {
    fn from(e: ReviewError) -> Self {
        Self(e)
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self(e.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ReviewError::Validation(_) | ReviewError::PathTraversal { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ReviewError::Unauthorized => StatusCode::UNAUTHORIZED,
            ReviewError::Forbidden(_) => StatusCode::FORBIDDEN,
            ReviewError::JobNotFound { .. } => StatusCode::NOT_FOUND,
            ReviewError::DuplicateProject { .. } | ReviewError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ReviewError::ResourceExhausted { .. } | ReviewError::RateLimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        ValidationError::Invalid {
            field: "body",
            message: rejection.body_text(),
        }
        .into()
    })
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        ValidationError::Invalid {
            field: "job_id",
            message: format!("'{raw}' is not a UUID"),
        }
        .into()
    })
}

/// Load a job and check it belongs to the caller.
async fn owned_job(state: &SharedState, project_id: &str, job_id: Uuid) -> Result<ReviewJob, ApiError> {
    let job = state
        .executor
        .context()
        .store
        .get_job(job_id)
        .await?
        .ok_or(ReviewError::JobNotFound { job_id })?;
    if job.project_id != project_id {
        tracing::warn!(job_id = %job_id, caller = %project_id, "Cross-project job access denied");
        return Err(ReviewError::Forbidden(format!("job {job_id} belongs to another project")).into());
    }
    Ok(job)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/reviews", post(submit_review))
        .route("/reviews/{job_id}", get(get_review))
        .route("/reviews/{job_id}/cancel", post(cancel_review))
        .route("/projects", post(register_project))
        .route("/resources/pool", get(pool_stats))
        .route("/resources/rate-limit", get(rate_limit_stats))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn submit_review(
    State(state): State<SharedState>,
    AuthenticatedProject(caller): AuthenticatedProject,
    body: Result<Json<SubmitReviewRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(body)?;
    req.validate()?;
    validate_identifier("project_id", &req.project_id)?;
    if req.project_id != caller {
        return Err(ReviewError::Forbidden(format!("credential is not valid for project {}", req.project_id)).into());
    }

    let job = state
        .executor
        .submit(ReviewSubmission {
            project_id: req.project_id,
            developer_id: req.developer_id,
            task_id: req.task_id,
            files: req.files,
            diff_content: req.diff_content,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitReviewResponse {
            job_id: job.job_id,
            status: job.status,
        }),
    ))
}

async fn get_review(
    State(state): State<SharedState>,
    AuthenticatedProject(caller): AuthenticatedProject,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = owned_job(&state, &caller, parse_job_id(&job_id)?).await?;
    Ok(Json(JobView::from(job)))
}

async fn cancel_review(
    State(state): State<SharedState>,
    AuthenticatedProject(caller): AuthenticatedProject,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = owned_job(&state, &caller, parse_job_id(&job_id)?).await?;
    if job.status.is_terminal() {
        return Err(ReviewError::InvalidTransition {
            job_id: job.job_id,
            from: job.status,
            to: JobStatus::Failed,
        }
        .into());
    }

    if !state.executor.cancel(job.job_id) {
        // No live task owns it (left over from a previous process).
        state.executor.context().store.fail(job.job_id, "cancelled").await?;
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"job_id": job.job_id, "status": "cancelling"})),
    ))
}

async fn register_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<RegisterProjectRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    check_admin(&headers, state.admin_token.as_deref())?;
    let req = json_body(body)?;
    let (record, token) = issue_credential(&req.project_id)?;
    state.executor.context().store.register_project(record).await?;
    tracing::info!(project_id = %req.project_id, "Project registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterProjectResponse {
            project_id: req.project_id,
            token,
        }),
    ))
}

async fn pool_stats(
    State(state): State<SharedState>,
    _caller: AuthenticatedProject,
) -> impl IntoResponse {
    Json(state.executor.context().pool.stats())
}

async fn rate_limit_stats(
    State(state): State<SharedState>,
    _caller: AuthenticatedProject,
) -> impl IntoResponse {
    Json(state.executor.context().bucket.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ExecutorConfig;
    use crate::orchestrator::test_support::{Harness, harness};
    use crate::reviewer::{Reviewer, StaticReviewer};
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wfc_common::{Finding, ReviewerRole};

    struct TestApp {
        h: Harness,
        state: SharedState,
    }

    impl TestApp {
        fn new(reviewer: Arc<dyn Reviewer>, admin_token: Option<&str>) -> Self {
            let h = harness(reviewer, 2);
            let state = Arc::new(AppState {
                executor: BackgroundExecutor::new(h.ctx.clone(), ExecutorConfig::default()),
                admin_token: admin_token.map(str::to_string),
            });
            Self { h, state }
        }

        fn router(&self) -> Router {
            api_router().with_state(self.state.clone())
        }

        async fn send(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
            let resp = self.router().oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, json)
        }

        async fn register(&self, project_id: &str) -> String {
            let (record, token) = issue_credential(project_id).unwrap();
            self.h.ctx.store.register_project(record).await.unwrap();
            token
        }
    }

    fn post_json(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    fn review_body(project_id: &str) -> serde_json::Value {
        serde_json::json!({
            "project_id": project_id,
            "developer_id": "alice",
            "task_id": "TASK-1",
            "files": ["src/lib.rs"],
            "diff_content": "+fn f() {}",
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new(Arc::new(StaticReviewer::new()), None);
        let resp = app
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_submit_and_poll_to_completion() {
        let finding = Finding::new("security", "sql-injection", "src/db.rs", 10, "raw query", 9.0, 9.0).unwrap();
        let app = TestApp::new(
            Arc::new(StaticReviewer::new().with_findings(ReviewerRole::Security, vec![finding])),
            None,
        );
        let token = app.register("p1").await;

        let (status, body) = app.send(post_json("/reviews", Some(&token), review_body("p1"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let mut last = serde_json::Value::Null;
        for _ in 0..200 {
            let (status, body) = app.send(get(&format!("/reviews/{job_id}"), &token)).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == "completed" {
                last = body;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(last["status"], "completed");
        assert_eq!(last["findings"].as_array().unwrap().len(), 1);
        assert!(last["consensus_score"].as_f64().unwrap() > 0.0);
        assert!(last["tier"].is_string());
    }

    #[tokio::test]
    async fn test_missing_or_bad_credential_is_401() {
        let app = TestApp::new(Arc::new(StaticReviewer::new()), None);
        app.register("p1").await;

        let (status, body) = app.send(post_json("/reviews", None, review_body("p1"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, _) = app.send(post_json("/reviews", Some("p1.guess"), review_body("p1"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cross_project_access_is_403() {
        let app = TestApp::new(Arc::new(StaticReviewer::new()), None);
        let token_a = app.register("pa").await;
        let token_b = app.register("pb").await;

        let (status, _) = app.send(post_json("/reviews", Some(&token_a), review_body("pb"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, body) = app.send(post_json("/reviews", Some(&token_a), review_body("pa"))).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();
        let (status, _) = app.send(get(&format!("/reviews/{job_id}"), &token_b)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_invalid_payloads_are_422() {
        let app = TestApp::new(Arc::new(StaticReviewer::new()), None);
        let token = app.register("p1").await;

        let mut unknown = review_body("p1");
        unknown["extra"] = serde_json::json!(true);
        let mut traversal = review_body("p1");
        traversal["task_id"] = serde_json::json!("../../etc");
        let mut bad_file = review_body("p1");
        bad_file["files"] = serde_json::json!(["../secret"]);
        let mut huge = review_body("p1");
        huge["diff_content"] = serde_json::json!("x".repeat(MAX_DIFF_BYTES + 1));

        for body in [unknown, traversal, bad_file, huge] {
            let (status, resp) = app.send(post_json("/reviews", Some(&token), body)).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{resp}");
        }
        assert_eq!(app.h.provisioner.create_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let app = TestApp::new(Arc::new(StaticReviewer::new()), None);
        let token = app.register("p1").await;
        let (status, _) = app.send(get(&format!("/reviews/{}", Uuid::new_v4()), &token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app.send(get("/reviews/not-a-uuid", &token)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_register_project_and_duplicate() {
        let app = TestApp::new(Arc::new(StaticReviewer::new()), Some("admin"));
        let body = serde_json::json!({"project_id": "fresh"});

        let (status, _) = app.send(post_json("/projects", None, body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, resp) = app.send(post_json("/projects", Some("admin"), body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let token = resp["token"].as_str().unwrap().to_string();
        assert!(token.starts_with("fresh."));

        let (status, _) = app.send(post_json("/projects", Some("admin"), body)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = app.send(get("/resources/pool", &token)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_resource_endpoints() {
        let app = TestApp::new(Arc::new(StaticReviewer::new()), None);
        let token = app.register("p1").await;

        let (status, pool) = app.send(get("/resources/pool", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pool["max"], 2);
        assert_eq!(pool["active"], 0);

        let (status, bucket) = app.send(get("/resources/rate-limit", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bucket["capacity"], 100);
        assert!(bucket["available_tokens"].as_f64().unwrap() <= 100.0);
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_409() {
        let app = TestApp::new(Arc::new(StaticReviewer::new()), None);
        let token = app.register("p1").await;
        let job = app
            .h
            .ctx
            .store
            .create_job(crate::jobs::NewJob {
                project_id: "p1".into(),
                developer_id: "alice".into(),
                task_id: "T".into(),
            })
            .await
            .unwrap();

        // Not owned by a live task: cancellation fails it directly.
        let uri = format!("/reviews/{}/cancel", job.job_id);
        let (status, _) = app.send(post_json(&uri, Some(&token), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = app.send(post_json(&uri, Some(&token), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ReviewError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ReviewError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ReviewError::JobNotFound { job_id: Uuid::nil() }, StatusCode::NOT_FOUND),
            (
                ReviewError::DuplicateProject { project_id: "p".into() },
                StatusCode::CONFLICT,
            ),
            (
                ReviewError::ResourceExhausted {
                    resource: "job queue",
                    waited: std::time::Duration::ZERO,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ReviewError::RateLimitExceeded {
                    requested: 1,
                    waited: std::time::Duration::ZERO,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ReviewError::OrchestrationFailure("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}
