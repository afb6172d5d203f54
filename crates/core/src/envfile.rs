//! `KEY=VALUE` environment-file handling
//!
//! The shim keeps its host-level configuration (real runtime path, logger
//! settings) in a single flat env file, by default `/etc/cryo/cryo.env`.
//! The file is shared between the installer, the locator, the logger, and
//! the `cryo log` command, so reads tolerate arbitrary junk lines and
//! writes are atomic (temp file + rename in the same directory).

use crate::errors::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the host configuration file
pub const DEFAULT_ENV_FILE: &str = "/etc/cryo/cryo.env";

/// Process-environment override for the env file location (tests, non-root
/// development)
pub const ENV_FILE_OVERRIDE: &str = "CRYO_ENV_FILE";

/// Resolve the env file path, honoring the `CRYO_ENV_FILE` override
pub fn default_path() -> PathBuf {
    std::env::var(ENV_FILE_OVERRIDE)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ENV_FILE))
}

/// Read the env file into a sorted map
///
/// A missing file is an empty configuration, not an error. Lines without a
/// `=` are ignored; keys and values are trimmed.
pub fn read(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    if !path.exists() {
        return Ok(entries);
    }
    let contents = fs::read_to_string(path)?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(entries)
}

/// Write the env file, one `KEY=VALUE` per line in key order
///
/// Creates parent directories as needed and replaces the file atomically so
/// a concurrent reader never observes a half-written configuration.
pub fn write(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = String::new();
    for (key, value) in entries {
        contents.push_str(key);
        contents.push('=');
        contents.push_str(value);
        contents.push('\n');
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("cryo.env");
    let temp_path = path
        .parent()
        .unwrap_or(Path::new("."))
        .join(format!(".{}.tmp", file_name));
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read-modify-write the env file in one step
pub fn update<F>(path: &Path, mutate: F) -> Result<()>
where
    F: FnOnce(&mut BTreeMap<String, String>),
{
    let mut entries = read(path)?;
    mutate(&mut entries);
    write(path, &entries)
}
