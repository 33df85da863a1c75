use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "wfc")]
#[command(version, about = "Multi-tenant code review orchestrator")]
pub struct Cli {
    /// Log at debug level regardless of configuration
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding wfc.toml, the job database and knowledge logs
    #[arg(long, global = true, env = "WFC_DATA_DIR", default_value = ".wfc")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the review HTTP service
    Serve {
        /// Port to listen on (overrides config and WFC_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Maximum concurrent worktrees (overrides config and WFC_MAX_WORKTREES)
        #[arg(long)]
        max_worktrees: Option<usize>,

        /// Directory containing one repository per project
        #[arg(long)]
        repos_root: Option<PathBuf>,
    },
    /// Register a project and print its credential
    Register {
        project_id: String,
    },
    /// Fail jobs left PENDING or IN_PROGRESS by a previous process
    Recover {
        /// Only recover jobs submitted at least this many seconds ago
        #[arg(long, default_value = "0")]
        older_than_secs: u64,
    },
    /// Score a findings file offline
    Score {
        /// JSON array of findings
        file: PathBuf,

        /// Number of reviewer passes attempted (defaults to the distinct reviewers in the file)
        #[arg(short, long)]
        reviewers: Option<usize>,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
    /// Write a default wfc.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            max_worktrees,
            repos_root,
        } => {
            let overrides = wfc::config::CliOverrides {
                port,
                max_worktrees,
                log_level: cli.verbose.then(|| "debug".to_string()),
                repos_root,
            };
            cmd::cmd_serve(&cli.data_dir, overrides).await?;
        }
        Commands::Register { project_id } => {
            cmd::cmd_register(&cli.data_dir, &project_id, cli.verbose).await?;
        }
        Commands::Recover { older_than_secs } => {
            cmd::cmd_recover(&cli.data_dir, older_than_secs, cli.verbose).await?;
        }
        Commands::Score { file, reviewers } => cmd::cmd_score(&cli.data_dir, &file, reviewers)?,
        Commands::Config { command } => cmd::cmd_config(&cli.data_dir, command)?,
    }

    Ok(())
}
