//! Review service command: `wfc serve`.

use std::path::Path;

use anyhow::Result;
use wfc::config::{CliOverrides, WfcConfig};

pub async fn cmd_serve(data_dir: &Path, overrides: CliOverrides) -> Result<()> {
    let config = WfcConfig::load(data_dir)?.with_overrides(overrides);
    let _guard = wfc::logging::init_logging(&config.toml.logging)?;
    tracing::debug!(data_dir = %data_dir.display(), "Configuration loaded");

    wfc::server::start_server(config).await
}
