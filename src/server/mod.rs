//! HTTP surface of the review service.
//!
//! ## Components
//!
//! - [`api`]: routes, payloads, and the `ReviewError` → status mapping
//! - [`auth`]: per-project bearer credentials
//!
//! [`start_server`] wires the full process lifecycle: open the job store,
//! recover stale jobs, build the shared [`ExecutionContext`], start the
//! background sweepers, serve until Ctrl+C, then drain in-flight jobs.
//!
//! [`ExecutionContext`]: crate::orchestrator::ExecutionContext

pub mod api;
pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::WfcConfig;
use crate::jobs::JobStore;
use crate::orchestrator::BackgroundExecutor;
use api::{AppState, MAX_DIFF_BYTES, SharedState};

/// Request bodies above this are refused before JSON parsing.
/// Leaves room for JSON escaping of a maximum-size diff.
pub const MAX_BODY_BYTES: usize = 4 * MAX_DIFF_BYTES;

/// Build the full application router.
pub fn build_router(state: SharedState, cors_permissive: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());
    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Run the service until Ctrl+C.
pub async fn start_server(config: WfcConfig) -> Result<()> {
    config.ensure_valid()?;

    let db_path = config.db_path();
    let store = JobStore::open(&db_path)
        .with_context(|| format!("Failed to open job database at {}", db_path.display()))?;
    let ctx = Arc::new(config.execution_context(store)?);
    let executor = BackgroundExecutor::new(ctx.clone(), config.executor_config());

    // Nothing is running yet, so every non-terminal job is left over from a
    // previous process.
    let recovered = executor
        .recover(Duration::ZERO)
        .await
        .context("Failed to recover stale jobs")?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "Failed jobs left over from a previous run");
    }

    let background = CancellationToken::new();
    let sweeper = ctx.pool.spawn_sweeper(
        Duration::from_secs(config.toml.pool.sweep_interval_secs.max(1)),
        background.clone(),
    );
    let maintenance = executor.spawn_maintenance(background.clone());

    let state = Arc::new(AppState {
        executor: executor.clone(),
        admin_token: config.toml.server.admin_token.clone(),
    });
    let app = build_router(state, config.toml.server.cors_permissive);

    let addr = format!("{}:{}", config.toml.server.host, config.toml.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        max_worktrees = config.toml.pool.max_worktrees,
        capacity = config.toml.rate_limit.capacity,
        "wfc review service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let grace = Duration::from_secs(config.toml.server.shutdown_grace_secs);
    if !executor.shutdown(grace).await {
        tracing::warn!("Some jobs were still running at exit; they will be recovered on next start");
    }
    background.cancel();
    let _ = tokio::join!(sweeper, maintenance);

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
