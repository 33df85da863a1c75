//! Tracing subscriber setup.
//!
//! Console output goes to stderr so command output on stdout stays clean.
//! `RUST_LOG` takes precedence over the configured level. With
//! `logging.dir` set, a daily-rolling file is written as well; keep the
//! returned guard alive until exit or buffered lines are lost.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogFormat, LoggingSection};

pub const LOG_FILE_PREFIX: &str = "wfc.log";

pub fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{}'", level)),
    }
}

pub fn init_logging(config: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(&config.level)?;

    let (file_writer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
            .try_init(),
    };
    result.context("Failed to install tracing subscriber")?;

    Ok(guard)
}
