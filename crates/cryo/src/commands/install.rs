//! Shim installation and removal
//!
//! Installation is a binary swap on the runtime's canonical path: the
//! original binary moves aside as `<path>.real`, its location is recorded
//! in the host env file, and the compiled `cryo-shim` takes its place.
//! Every supervisor invocation then flows through the shim with no
//! supervisor-side configuration at all. Uninstall reverses the swap.

use anyhow::{bail, Context, Result};
use cryo_core::envfile;
use cryo_core::locator::{RuntimeLocator, ENV_REAL_RUNC_CMD};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Host packages the shim cannot work without
const REQUIRED_TOOLS: &[&str] = &["runc", "criu", "containerd"];

const BACKUP_SUFFIX: &str = ".real";

pub fn install() -> Result<i32> {
    ensure_root()?;
    for tool in REQUIRED_TOOLS {
        which::which(tool)
            .with_context(|| format!("required dependency '{}' not found on PATH", tool))?;
    }

    if is_installed() {
        info!("cryo is already installed");
        return Ok(0);
    }

    let runtime_path = which::which("runc").context("could not find runc binary")?;
    let backup_path = backup_path_for(&runtime_path);
    if !backup_path.exists() {
        fs::copy(&runtime_path, &backup_path).with_context(|| {
            format!(
                "failed to back up {} to {}",
                runtime_path.display(),
                backup_path.display()
            )
        })?;
        info!(backup = %backup_path.display(), "backed up original runtime");
    }

    let env_file = envfile::default_path();
    envfile::update(&env_file, |entries| {
        entries.insert(
            ENV_REAL_RUNC_CMD.to_string(),
            backup_path.display().to_string(),
        );
    })
    .with_context(|| format!("failed to write {}", env_file.display()))?;

    let shim = sibling_binary("cryo-shim")
        .context("cryo-shim binary not found next to the cryo executable")?;
    replace_file(&shim, &runtime_path)?;
    info!(path = %runtime_path.display(), "shim installed over runtime");
    Ok(0)
}

pub fn uninstall() -> Result<i32> {
    ensure_root()?;
    let runtime_path = which::which("runc").context("could not find runc binary")?;
    let backup_path = backup_path_for(&runtime_path);

    if backup_path.exists() {
        replace_file(&backup_path, &runtime_path)?;
        fs::remove_file(&backup_path)
            .with_context(|| format!("failed to remove backup {}", backup_path.display()))?;
        info!(path = %runtime_path.display(), "restored original runtime");
    } else {
        warn!(backup = %backup_path.display(), "no backup found, leaving runtime binary alone");
    }

    let env_file = envfile::default_path();
    if env_file.exists() {
        fs::remove_file(&env_file)
            .with_context(|| format!("failed to remove {}", env_file.display()))?;
        info!(path = %env_file.display(), "removed host configuration");
    }

    info!("uninstall complete");
    Ok(0)
}

/// Installed iff the locator already resolves a usable real runtime
fn is_installed() -> bool {
    RuntimeLocator::new().resolve().is_ok()
}

fn backup_path_for(runtime_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{}", runtime_path.display(), BACKUP_SUFFIX))
}

fn ensure_root() -> Result<()> {
    // /proc/self is owned by the effective uid
    let euid = fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(u32::MAX);
    if euid != 0 {
        bail!("this command must be run as root");
    }
    Ok(())
}

fn sibling_binary(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let path = exe.parent()?.join(name);
    path.exists().then_some(path)
}

/// Copy `src` over `dest`, executable
///
/// The destination is removed first; overwriting a running binary in place
/// fails with ETXTBSY.
fn replace_file(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_file(dest)
            .with_context(|| format!("failed to remove {}", dest.display()))?;
    }
    fs::copy(src, dest)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dest.display()))?;
    let mut perms = fs::metadata(dest)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(dest, perms)?;
    Ok(())
}
