//! Durable per-container flag records
//!
//! A `create` and the `start` that follows it are separate processes; they
//! coordinate through one small JSON document per container, stored as
//! `{namespace}_{container_id}.json` under the state directory. Advisory
//! file locks make the records safe against the other writers in the
//! system (sibling shim invocations, the event listener, the admin CLI):
//! shared lock for reads, exclusive for writes, so a reader sees either
//! the pre-write or the post-write document, never a torn one.
//!
//! Reads are deliberately forgiving. A corrupt or missing record answers
//! with defaults (`false` flags, no exit code) because every lifecycle
//! decision must stay safe when the record cannot be trusted. Writes of an
//! invalid record are a programmer error.

use crate::errors::{CryoError, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default state directory for flag records
pub const DEFAULT_STATE_DIR: &str = "/var/lib/cryo/state";

/// Process-environment override for the state directory (tests, non-root
/// development)
pub const ENV_STATE_DIR: &str = "CRYO_STATE_DIR";

/// Current flag record schema version
pub const RECORD_VERSION: &str = "1.0";

const RECORD_EXT: &str = "json";

/// The per-container document carried between sibling invocations
///
/// Unknown fields in stored documents are ignored on read, which leaves
/// room for forward-compatible additions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagRecord {
    /// Schema version, currently "1.0"
    pub version: String,
    /// Next `start` is a no-op; set after a successful restore
    pub skip_start: bool,
    /// Next `resume` is a no-op; set after a successful checkpoint
    pub skip_resume: bool,
    /// Next `delete` must preserve checkpoint and scratch storage
    pub keep_resources: bool,
    /// Exit status when known; written only by the event listener
    pub exit_code: Option<i64>,
    /// RFC 3339 timestamp of the last mutation
    pub last_updated: String,
}

impl FlagRecord {
    fn initial() -> Self {
        Self {
            version: RECORD_VERSION.to_string(),
            skip_start: false,
            skip_resume: false,
            keep_resources: false,
            exit_code: None,
            last_updated: Utc::now().to_rfc3339(),
        }
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now().to_rfc3339();
    }

    fn is_valid(&self) -> bool {
        !self.version.is_empty() && !self.last_updated.is_empty()
    }
}

/// Store of per-container flag records under a shared state directory
#[derive(Debug, Clone)]
pub struct FlagStore {
    state_dir: PathBuf,
}

impl FlagStore {
    /// Open the store at the default (or `CRYO_STATE_DIR`-overridden)
    /// location, creating the directory with mode `0755` on first use
    pub fn new() -> Result<Self> {
        let state_dir = std::env::var(ENV_STATE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR));
        Self::with_state_dir(state_dir)
    }

    /// Open the store at a specific directory
    pub fn with_state_dir<P: Into<PathBuf>>(state_dir: P) -> Result<Self> {
        let state_dir = state_dir.into();
        if !state_dir.exists() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true).mode(0o755);
            builder.create(&state_dir)?;
        }
        Ok(Self { state_dir })
    }

    /// The directory holding the records
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn record_path(&self, namespace: &str, container_id: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}_{}.{}", namespace, container_id, RECORD_EXT))
    }

    /// Whether a record exists for the container
    pub fn exists(&self, namespace: &str, container_id: &str) -> bool {
        self.record_path(namespace, container_id).exists()
    }

    /// Create (or reset) the record with all flags cleared
    ///
    /// Creating twice is not an error; the second call simply resets.
    pub fn create(&self, namespace: &str, container_id: &str) -> Result<()> {
        let path = self.record_path(namespace, container_id);
        self.write_record(&path, &FlagRecord::initial())?;
        info!(
            namespace = %namespace,
            container_id = %container_id,
            "created flag record"
        );
        Ok(())
    }

    /// Remove the record; missing is not an error
    pub fn remove(&self, namespace: &str, container_id: &str) -> Result<()> {
        let path = self.record_path(namespace, container_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(
                    namespace = %namespace,
                    container_id = %container_id,
                    "removed flag record"
                );
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Enumerate `(namespace, container_id)` pairs with records
    ///
    /// Filenames split on the first underscore; anything else in the state
    /// directory is ignored.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let mut containers = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{}", RECORD_EXT)) else {
                continue;
            };
            if let Some((namespace, container_id)) = stem.split_once('_') {
                containers.push((namespace.to_string(), container_id.to_string()));
            }
        }
        Ok(containers)
    }

    /// Read the full record; `None` when missing or unreadable
    pub fn load(&self, namespace: &str, container_id: &str) -> Option<FlagRecord> {
        self.read_record(&self.record_path(namespace, container_id))
    }

    /// The `skip_start` latch value (default false)
    pub fn skip_start(&self, namespace: &str, container_id: &str) -> bool {
        self.load(namespace, container_id)
            .map(|record| record.skip_start)
            .unwrap_or(false)
    }

    /// Set the `skip_start` latch
    pub fn set_skip_start(&self, namespace: &str, container_id: &str, value: bool) -> Result<()> {
        self.update(namespace, container_id, |record| record.skip_start = value)
    }

    /// Read and clear `skip_start` under one exclusive lock
    ///
    /// Returns the prior value; the latch fires at most once.
    pub fn consume_skip_start(&self, namespace: &str, container_id: &str) -> Result<bool> {
        self.consume(namespace, container_id, |record| {
            let fired = record.skip_start;
            record.skip_start = false;
            fired
        })
    }

    /// The `skip_resume` latch value (default false)
    pub fn skip_resume(&self, namespace: &str, container_id: &str) -> bool {
        self.load(namespace, container_id)
            .map(|record| record.skip_resume)
            .unwrap_or(false)
    }

    /// Latch a completed checkpoint: `skip_resume` and `keep_resources`
    /// together, in one write
    pub fn mark_checkpointed(&self, namespace: &str, container_id: &str) -> Result<()> {
        self.update(namespace, container_id, |record| {
            record.skip_resume = true;
            record.keep_resources = true;
        })
    }

    /// Read and clear `skip_resume` under one exclusive lock
    ///
    /// Also releases `keep_resources`: once the container resumes, the
    /// checkpoint handoff is over and the next delete may reclaim storage.
    pub fn consume_skip_resume(&self, namespace: &str, container_id: &str) -> Result<bool> {
        self.consume(namespace, container_id, |record| {
            let fired = record.skip_resume;
            record.skip_resume = false;
            record.keep_resources = false;
            fired
        })
    }

    /// The `keep_resources` flag (default false)
    pub fn keep_resources(&self, namespace: &str, container_id: &str) -> bool {
        self.load(namespace, container_id)
            .map(|record| record.keep_resources)
            .unwrap_or(false)
    }

    /// The recorded exit code, when the event listener has seen one
    pub fn exit_code(&self, namespace: &str, container_id: &str) -> Option<i64> {
        self.load(namespace, container_id)
            .and_then(|record| record.exit_code)
    }

    /// Record the container's exit status (event listener only)
    pub fn set_exit_code(&self, namespace: &str, container_id: &str, exit_code: i64) -> Result<()> {
        self.update(namespace, container_id, |record| {
            record.exit_code = Some(exit_code)
        })
    }

    fn read_record(&self, path: &Path) -> Option<FlagRecord> {
        let mut file = File::open(path).ok()?;
        if let Err(err) = file.lock_shared() {
            warn!(path = %path.display(), error = %err, "failed to lock flag record for read");
            return None;
        }
        let mut contents = String::new();
        if file.read_to_string(&mut contents).is_err() {
            return None;
        }
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "invalid flag record");
                None
            }
        }
    }

    /// Overwrite the record, taking the exclusive lock before truncating so
    /// concurrent readers never observe an empty file
    fn write_record(&self, path: &Path, record: &FlagRecord) -> Result<()> {
        debug_assert!(record.is_valid());
        if !record.is_valid() {
            return Err(CryoError::FlagRecord {
                message: format!("refusing to write invalid record to {}", path.display()),
            });
        }
        let payload = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(payload.as_bytes())?;
        Ok(())
    }

    /// Read-modify-write under a single exclusive lock
    ///
    /// A missing record is a no-op with a warning: flag mutations only make
    /// sense for containers the engine has already registered.
    fn update<F>(&self, namespace: &str, container_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut FlagRecord),
    {
        let path = self.record_path(namespace, container_id);
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(
                    namespace = %namespace,
                    container_id = %container_id,
                    "cannot update flags: no record exists"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        file.lock_exclusive()?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let mut record: FlagRecord = serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "resetting corrupt flag record");
            FlagRecord::initial()
        });

        mutate(&mut record);
        record.touch();
        debug_assert!(record.is_valid());
        if !record.is_valid() {
            return Err(CryoError::FlagRecord {
                message: format!("refusing to write invalid record to {}", path.display()),
            });
        }

        let payload = serde_json::to_string(&record)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(payload.as_bytes())?;
        Ok(())
    }

    /// Shared implementation of the consume-on-read latches
    fn consume<F>(&self, namespace: &str, container_id: &str, take: F) -> Result<bool>
    where
        F: FnOnce(&mut FlagRecord) -> bool,
    {
        let path = self.record_path(namespace, container_id);
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        file.lock_exclusive()?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let mut record: FlagRecord = match serde_json::from_str(&contents) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "invalid flag record, latch not fired");
                return Ok(false);
            }
        };

        let fired = take(&mut record);
        if fired {
            record.touch();
            let payload = serde_json::to_string(&record)?;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(payload.as_bytes())?;
        }
        Ok(fired)
    }
}
