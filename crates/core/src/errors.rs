//! Error types and handling
//!
//! Domain errors for the shim. Anything that happens after the opt-in check
//! is downgraded to a pass-through by the lifecycle engine; these variants
//! mostly matter for the fatal pre-opt-in paths and for tests.

use thiserror::Error;

/// Domain errors for the cryo shim
#[derive(Error, Debug)]
pub enum CryoError {
    /// The shim was invoked with an empty argv
    #[error("empty command: nothing to parse")]
    EmptyCommand,

    /// The real runtime binary could not be resolved; this is a
    /// misinstallation, not a runtime condition
    #[error("real runtime binary not found; set CRYO_REAL_RUNC_CMD or re-run `cryo install`")]
    RuntimeNotFound,

    /// A flag record failed validation on write
    #[error("invalid flag record: {message}")]
    FlagRecord { message: String },

    /// Checkpoint archive operation failed
    #[error("checkpoint error: {message}")]
    Checkpoint { message: String },

    /// Underlying I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience type alias for Results with CryoError
pub type Result<T> = std::result::Result<T, CryoError>;
