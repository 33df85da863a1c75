//! Configuration view and validation commands: `wfc config`.

use std::path::Path;

use anyhow::{Context, Result};
use wfc::config::{WfcConfig, WfcToml};

use super::super::ConfigCommands;

pub fn cmd_config(data_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = data_dir.join(wfc::config::CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No wfc.toml at {}; showing defaults", config_path.display());
            }
            println!("# Effective values (file + environment overrides)");
            println!();

            let config = WfcConfig::load(data_dir)?;
            let mut shown = config.toml.clone();
            if shown.server.admin_token.is_some() {
                shown.server.admin_token = Some("<redacted>".to_string());
            }
            print!("{}", toml::to_string_pretty(&shown).context("Failed to render configuration")?);
            println!();
            println!("# Derived paths");
            println!("#   database:  {}", config.db_path().display());
            println!("#   knowledge: {}", config.knowledge_root().display());
            println!("#   worktrees: {}", config.worktree_root().display());
            println!("#   repos:     {}", config.repos_root().display());
        }
        Some(ConfigCommands::Validate) => {
            let config = WfcConfig::load(data_dir)?;
            let errors = config.toml.validate();
            if errors.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration errors:");
                for error in &errors {
                    println!("  - {}", error);
                }
                anyhow::bail!("{} configuration error(s)", errors.len());
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("wfc.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("Failed to create {}", data_dir.display()))?;
            WfcToml::default().save(&config_path)?;

            println!("Created wfc.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] port, admin_token");
            println!("  - [pool] max_worktrees, provisioner");
            println!("  - [review] command, roles");
        }
    }

    Ok(())
}
