//! Project and job maintenance commands: `wfc register`, `wfc recover`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use wfc::config::{CliOverrides, WfcConfig};
use wfc::jobs::JobStore;
use wfc::server::auth::issue_credential;

fn load(data_dir: &Path, verbose: bool) -> Result<(WfcConfig, Option<WorkerGuard>)> {
    let config = WfcConfig::load(data_dir)?.with_overrides(CliOverrides {
        log_level: verbose.then(|| "debug".to_string()),
        ..Default::default()
    });
    let guard = wfc::logging::init_logging(&config.toml.logging)?;
    Ok((config, guard))
}

pub async fn cmd_register(data_dir: &Path, project_id: &str, verbose: bool) -> Result<()> {
    let (config, _guard) = load(data_dir, verbose)?;
    let store = JobStore::open(&config.db_path()).context("Failed to open job database")?;

    let (record, token) = issue_credential(project_id)?;
    store.register_project(record).await?;

    println!("Registered project {}", project_id);
    println!("Credential (shown once): {}", token);
    Ok(())
}

/// Offline recovery: no process owns any job, so nothing is excluded.
pub async fn cmd_recover(data_dir: &Path, older_than_secs: u64, verbose: bool) -> Result<()> {
    let (config, _guard) = load(data_dir, verbose)?;
    let store = JobStore::open(&config.db_path()).context("Failed to open job database")?;

    let recovered = store
        .recover_stale(Duration::from_secs(older_than_secs), Vec::new())
        .await?;
    if recovered.is_empty() {
        println!("No stale jobs.");
    } else {
        println!("Marked {} stale job(s) as failed:", recovered.len());
        for job_id in recovered {
            println!("  {}", job_id);
        }
    }
    Ok(())
}
