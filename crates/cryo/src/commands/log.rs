//! Logger configuration
//!
//! Rewrites the `CRYO_LOG_LEVEL` / `CRYO_LOG_FILE` keys in the host env
//! file; every cryo process picks the new values up on its next start.

use anyhow::{Context, Result};
use cryo_core::envfile;
use cryo_core::logging::{ENV_LOG_FILE, ENV_LOG_LEVEL};
use std::path::PathBuf;
use tracing::info;

use crate::cli::LogLevel;

pub fn run(level: Option<LogLevel>, file: Option<PathBuf>) -> Result<i32> {
    let config_path = envfile::default_path();

    let log_file = match file {
        Some(file) if file.is_relative() => Some(std::env::current_dir()?.join(file)),
        other => other,
    };

    envfile::update(&config_path, |entries| {
        if let Some(level) = level {
            entries.insert(ENV_LOG_LEVEL.to_string(), level.as_str().to_string());
        }
        if let Some(log_file) = &log_file {
            entries.insert(ENV_LOG_FILE.to_string(), log_file.display().to_string());
        }
    })
    .with_context(|| format!("failed to update {}", config_path.display()))?;

    info!(
        config = %config_path.display(),
        level = level.map(|l| l.as_str()).unwrap_or("unchanged"),
        "logger configuration updated"
    );
    Ok(0)
}
