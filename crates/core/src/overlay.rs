//! Overlay upper-directory discovery
//!
//! A container's writable layer lives in the `upperdir` of its overlay
//! mount. The probe scans the host mount table for an overlay entry
//! mentioning the container id and pulls the `upperdir=` option out of it.
//! No caching: mounts appear and disappear with the container.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DEFAULT_MOUNT_TABLE: &str = "/proc/mounts";

/// Finds the overlay upperdir backing a container's root filesystem
#[derive(Debug, Clone)]
pub struct OverlayProbe {
    mount_table: PathBuf,
}

impl Default for OverlayProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayProbe {
    /// Probe the host mount table
    pub fn new() -> Self {
        Self {
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
        }
    }

    /// Probe a specific mount table file (tests)
    pub fn with_mount_table<P: Into<PathBuf>>(mount_table: P) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }

    /// Return the upperdir of the overlay mount backing `container_id`
    ///
    /// Matches any overlay line whose device or mount point mentions the
    /// container id; the `upperdir=` value runs to the next `,` or `)`.
    pub fn upperdir(&self, container_id: &str) -> Option<PathBuf> {
        if container_id.is_empty() {
            return None;
        }
        let table = match fs::read_to_string(&self.mount_table) {
            Ok(table) => table,
            Err(err) => {
                warn!(
                    mount_table = %self.mount_table.display(),
                    error = %err,
                    "failed to read mount table"
                );
                return None;
            }
        };

        for line in table.lines() {
            if !line.contains("overlay") || !line.contains(container_id) {
                continue;
            }
            if let Some(upperdir) = extract_upperdir(line) {
                debug!(container_id = %container_id, upperdir = %upperdir, "found upperdir");
                return Some(PathBuf::from(upperdir));
            }
        }

        warn!(container_id = %container_id, "no overlay upperdir found");
        None
    }
}

fn extract_upperdir(line: &str) -> Option<&str> {
    let start = line.find("upperdir=")? + "upperdir=".len();
    let rest = &line[start..];
    let end = rest
        .find(|c| c == ',' || c == ')')
        .unwrap_or(rest.len());
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
