//! Checkpoint archive management
//!
//! The real runtime dumps process state into the checkpoint directory; this
//! module adds the piece the runtime does not cover, the container's
//! writable overlay layer. The layer travels as `container_files.tar`, a
//! gzipped tar rooted at the upperdir's leaf name so extraction can strip
//! the first path component and land directly in a fresh upperdir.
//!
//! The shim never produces `dump.log`; it only validates the one the
//! runtime left behind.

use crate::errors::{CryoError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Dump log written by the real runtime into the checkpoint directory
pub const DUMP_LOG: &str = "dump.log";

/// Archive of the container's writable layer, written by [`save`]
pub const FILES_ARCHIVE: &str = "container_files.tar";

const DUMP_SUCCESS_MARKER: &str = "Dumping finished successfully";

/// Check that a checkpoint directory holds a completed dump
///
/// True iff `dump.log` exists and its final non-empty line contains the
/// runtime's success marker.
pub fn validate(checkpoint_dir: &Path) -> bool {
    let dump_log = checkpoint_dir.join(DUMP_LOG);
    let contents = match fs::read_to_string(&dump_log) {
        Ok(contents) => contents,
        Err(_) => {
            warn!(path = %dump_log.display(), "dump.log not readable, checkpoint invalid");
            return false;
        }
    };
    let last_line = contents
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty());
    match last_line {
        Some(line) if line.contains(DUMP_SUCCESS_MARKER) => true,
        _ => {
            warn!(path = %dump_log.display(), "dump did not finish successfully");
            false
        }
    }
}

/// Pack the upperdir into `checkpoint_dir/container_files.tar`
///
/// The archive's root entry is the upperdir's leaf name; the checkpoint
/// directory is created if needed.
pub fn save(upperdir: &Path, checkpoint_dir: &Path) -> Result<()> {
    if !upperdir.exists() {
        return Err(CryoError::Checkpoint {
            message: format!("upperdir does not exist: {}", upperdir.display()),
        });
    }
    fs::create_dir_all(checkpoint_dir)?;

    let archive_path = checkpoint_dir.join(FILES_ARCHIVE);
    let file = File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let root = upperdir
        .file_name()
        .map(|name| PathBuf::from(name))
        .unwrap_or_else(|| PathBuf::from("upper"));
    builder.append_dir_all(&root, upperdir)?;
    builder.into_inner()?.finish()?;

    info!(
        upperdir = %upperdir.display(),
        archive = %archive_path.display(),
        "saved container files"
    );
    Ok(())
}

/// Unpack `checkpoint_dir/container_files.tar` into the upperdir
///
/// Strips the first path component of every member, whatever its name.
/// An existing `upperdir/fs` is parked as `fs.bak` for the duration of the
/// extraction and removed once it succeeds. Atomicity is best effort; a
/// failed extraction leaves the upperdir for [`rollback`].
pub fn restore(checkpoint_dir: &Path, upperdir: &Path) -> Result<()> {
    if !checkpoint_dir.exists() {
        return Err(CryoError::Checkpoint {
            message: format!("checkpoint does not exist: {}", checkpoint_dir.display()),
        });
    }
    if !upperdir.exists() {
        return Err(CryoError::Checkpoint {
            message: format!("upperdir does not exist: {}", upperdir.display()),
        });
    }
    let archive_path = checkpoint_dir.join(FILES_ARCHIVE);
    if !archive_path.exists() {
        return Err(CryoError::Checkpoint {
            message: format!("archive not found: {}", archive_path.display()),
        });
    }

    // Park the live fs directory so a restored tree replaces it cleanly
    let fs_dir = upperdir.join("fs");
    let backup_dir = upperdir.join("fs.bak");
    if fs_dir.exists() {
        if backup_dir.exists() {
            fs::remove_dir_all(&backup_dir)?;
        }
        fs::rename(&fs_dir, &backup_dir)?;
    }

    let file = File::open(&archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            // The root directory entry itself
            continue;
        }
        let dest = upperdir.join(&stripped);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }

    if backup_dir.exists() {
        fs::remove_dir_all(&backup_dir)?;
    }

    info!(
        archive = %archive_path.display(),
        upperdir = %upperdir.display(),
        "restored container files"
    );
    Ok(())
}

/// Remove the upperdir after a failed restore
///
/// Unconditional and idempotent; only the lifecycle engine calls this, and
/// only once a restore has already failed.
pub fn rollback(upperdir: &Path) -> Result<()> {
    if upperdir.exists() {
        warn!(upperdir = %upperdir.display(), "removing upperdir after failed restore");
        fs::remove_dir_all(upperdir)?;
    } else {
        debug!(upperdir = %upperdir.display(), "nothing to roll back");
    }
    Ok(())
}

/// Remove a checkpoint directory; missing is not an error
pub fn cleanup(checkpoint_dir: &Path) -> Result<()> {
    if checkpoint_dir.exists() {
        info!(path = %checkpoint_dir.display(), "removing checkpoint");
        fs::remove_dir_all(checkpoint_dir)?;
    }
    Ok(())
}
