//! Offline consensus scoring: `wfc score`.

use std::path::Path;

use anyhow::{Context, Result};
use wfc::consensus::{ConsensusScorer, ReviewerPass};
use wfc::config::WfcToml;
use wfc_common::Finding;

/// Score a JSON array of findings and print the result as JSON.
///
/// Scoring settings come from `[scoring]` in the data directory's wfc.toml.
pub fn cmd_score(data_dir: &Path, file: &Path, reviewers: Option<usize>) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read findings file: {}", file.display()))?;
    let findings: Vec<Finding> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of valid findings", file.display()))?;

    let config_path = data_dir.join(wfc::config::CONFIG_FILE);
    let scoring = if config_path.exists() {
        WfcToml::load(&config_path)?.scoring
    } else {
        Default::default()
    };

    let passes = ReviewerPass::group(findings, reviewers)?;
    let task_id = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let result = ConsensusScorer::new(scoring).score(&task_id, &passes);

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
