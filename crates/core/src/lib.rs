//! Core library for the cryo runtime shim
//!
//! This crate contains the interception logic shared by the `cryo-shim`
//! wrapper binary, the `cryo` administrative CLI, and the `cryo-events`
//! listener: command parsing, container config handling, overlay discovery,
//! checkpoint archiving, the durable flag store, the lifecycle engine, and
//! the real-runtime locator.

pub mod checkpoint;
pub mod command;
pub mod container_config;
pub mod envfile;
pub mod errors;
pub mod events;
pub mod flags;
pub mod lifecycle;
pub mod locator;
pub mod logging;
pub mod overlay;
pub mod runtime_state;

// Re-export IndexMap for use by dependent crates (preserves insertion order
// of parsed runc options so reconstructed commands stay stable)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
