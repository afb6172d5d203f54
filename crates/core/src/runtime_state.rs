//! Container runtime state queries
//!
//! Thin wrapper around `runc state`, used by the finalizer to decide which
//! opted-in containers are still running. Talks to the *real* runtime
//! binary resolved by the locator so the query does not bounce through the
//! shim itself.

use crate::errors::Result;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

/// Root directory template the supervisor uses per namespace
const RUNTIME_ROOT_PREFIX: &str = "/run/containerd/runc";

/// State reported by the runtime for one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeState {
    /// Lifecycle status string (`created`, `running`, `stopped`, ...)
    pub status: Option<String>,
    /// Exit code when the runtime reports one
    pub exit_code: Option<i64>,
}

impl RuntimeState {
    /// Whether the container is currently running
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }
}

/// Queries `runc state` for container status
#[derive(Debug, Clone)]
pub struct RuntimeStateProbe {
    runtime_path: PathBuf,
}

impl RuntimeStateProbe {
    /// Probe using the given real runtime binary
    pub fn new<P: Into<PathBuf>>(runtime_path: P) -> Self {
        Self {
            runtime_path: runtime_path.into(),
        }
    }

    /// Query the state of one container
    ///
    /// A non-zero runtime exit (typically "container does not exist")
    /// yields an empty state rather than an error.
    pub fn query(&self, namespace: &str, container_id: &str) -> Result<RuntimeState> {
        let root = format!("{}/{}", RUNTIME_ROOT_PREFIX, namespace);
        debug!(
            runtime = %self.runtime_path.display(),
            root = %root,
            container_id = %container_id,
            "querying container state"
        );
        let output = Command::new(&self.runtime_path)
            .arg("--root")
            .arg(&root)
            .arg("state")
            .arg(container_id)
            .output()?;

        if !output.status.success() {
            warn!(
                container_id = %container_id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "state query failed"
            );
            return Ok(RuntimeState::default());
        }

        let state: Value = match serde_json::from_slice(&output.stdout) {
            Ok(state) => state,
            Err(err) => {
                warn!(container_id = %container_id, error = %err, "unparseable state output");
                return Ok(RuntimeState::default());
            }
        };

        Ok(RuntimeState {
            status: state
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            exit_code: state.get("exitCode").and_then(Value::as_i64),
        })
    }
}
