//! Real runtime binary resolution
//!
//! The shim sits on the runtime's canonical path, so the genuine binary has
//! to be found elsewhere: first through the `CRYO_REAL_RUNC_CMD` process
//! environment variable, then through the same key in the host env file
//! written by the installer. Failing both is a misinstallation and fatal.

use crate::envfile;
use crate::errors::{CryoError, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable (and env-file key) naming the real runtime binary
pub const ENV_REAL_RUNC_CMD: &str = "CRYO_REAL_RUNC_CMD";

/// Resolves the path to the real OCI runtime
#[derive(Debug, Clone)]
pub struct RuntimeLocator {
    env_file: PathBuf,
}

impl Default for RuntimeLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeLocator {
    /// Create a locator using the default env file location
    pub fn new() -> Self {
        Self {
            env_file: envfile::default_path(),
        }
    }

    /// Create a locator reading a specific env file
    pub fn with_env_file<P: Into<PathBuf>>(env_file: P) -> Self {
        Self {
            env_file: env_file.into(),
        }
    }

    /// Resolve the real runtime path
    ///
    /// Precedence: `CRYO_REAL_RUNC_CMD` environment variable, then the same
    /// key in the env file. The resolved path must exist and be executable.
    pub fn resolve(&self) -> Result<PathBuf> {
        self.resolve_from(std::env::var(ENV_REAL_RUNC_CMD).ok())
    }

    fn resolve_from(&self, env_value: Option<String>) -> Result<PathBuf> {
        if let Some(path) = env_value {
            let path = PathBuf::from(path);
            if is_executable(&path) {
                debug!(path = %path.display(), "resolved real runtime from environment");
                return Ok(path);
            }
            warn!(
                path = %path.display(),
                "{} points at a non-executable path, trying env file", ENV_REAL_RUNC_CMD
            );
        }

        let entries = envfile::read(&self.env_file).unwrap_or_default();
        if let Some(path) = entries.get(ENV_REAL_RUNC_CMD) {
            let path = PathBuf::from(path);
            if is_executable(&path) {
                debug!(
                    path = %path.display(),
                    env_file = %self.env_file.display(),
                    "resolved real runtime from env file"
                );
                return Ok(path);
            }
        }

        Err(CryoError::RuntimeNotFound)
    }
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_runc(dir: &Path) -> PathBuf {
        let path = dir.join("runc.real");
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_resolve_from_environment_value() {
        let tmp = TempDir::new().unwrap();
        let runc = fake_runc(tmp.path());
        let locator = RuntimeLocator::with_env_file(tmp.path().join("absent.env"));
        let resolved = locator
            .resolve_from(Some(runc.display().to_string()))
            .unwrap();
        assert_eq!(resolved, runc);
    }

    #[test]
    fn test_resolve_falls_back_to_env_file() {
        let tmp = TempDir::new().unwrap();
        let runc = fake_runc(tmp.path());
        let env_file = tmp.path().join("cryo.env");
        fs::write(
            &env_file,
            format!("{}={}\n", ENV_REAL_RUNC_CMD, runc.display()),
        )
        .unwrap();
        let locator = RuntimeLocator::with_env_file(&env_file);
        let resolved = locator.resolve_from(None).unwrap();
        assert_eq!(resolved, runc);
    }

    #[test]
    fn test_non_executable_path_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("runc.real");
        fs::write(&plain, "not a binary").unwrap();
        let mut perms = fs::metadata(&plain).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&plain, perms).unwrap();

        let locator = RuntimeLocator::with_env_file(tmp.path().join("absent.env"));
        let err = locator
            .resolve_from(Some(plain.display().to_string()))
            .unwrap_err();
        assert!(matches!(err, CryoError::RuntimeNotFound));
    }

    #[test]
    fn test_unresolvable_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let locator = RuntimeLocator::with_env_file(tmp.path().join("absent.env"));
        assert!(matches!(
            locator.resolve_from(None),
            Err(CryoError::RuntimeNotFound)
        ));
    }

    #[test]
    fn test_environment_wins_over_env_file() {
        let tmp = TempDir::new().unwrap();
        let env_runc = fake_runc(tmp.path());
        let file_dir = TempDir::new().unwrap();
        let file_runc = fake_runc(file_dir.path());
        let env_file = tmp.path().join("cryo.env");
        fs::write(
            &env_file,
            format!("{}={}\n", ENV_REAL_RUNC_CMD, file_runc.display()),
        )
        .unwrap();

        let locator = RuntimeLocator::with_env_file(&env_file);
        let resolved = locator
            .resolve_from(Some(env_runc.display().to_string()))
            .unwrap();
        assert_eq!(resolved, env_runc);
    }
}
