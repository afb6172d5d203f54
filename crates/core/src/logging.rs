//! Logging and observability
//!
//! Structured logging for every cryo process. The level and an optional log
//! file come from the host env file (`CRYO_LOG_LEVEL`, `CRYO_LOG_FILE`),
//! with the process environment taking precedence; `cryo log` rewrites the
//! env file so operators can adjust verbosity without touching the shim.
//!
//! Console output always goes to stderr: the shim's stdout belongs to the
//! real runtime (supervisors parse it).

use crate::envfile;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Env-file key / environment variable selecting the log level
pub const ENV_LOG_LEVEL: &str = "CRYO_LOG_LEVEL";

/// Env-file key / environment variable naming an additional log file
pub const ENV_LOG_FILE: &str = "CRYO_LOG_FILE";

/// Initialize the logging system
///
/// Safe to call from every binary entry point; a second initialization in
/// the same process is a no-op.
pub fn init() {
    let config = envfile::read(&envfile::default_path()).unwrap_or_default();

    let level = std::env::var(ENV_LOG_LEVEL)
        .ok()
        .or_else(|| config.get(ENV_LOG_LEVEL).cloned())
        .unwrap_or_else(|| "info".to_string());
    let filter =
        EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = std::env::var(ENV_LOG_FILE)
        .ok()
        .or_else(|| config.get(ENV_LOG_FILE).cloned());

    let file_layer = log_file.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()
            .map(|file| fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
    });

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .try_init();
}
