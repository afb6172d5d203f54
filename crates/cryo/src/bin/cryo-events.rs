//! Supervisor event listener
//!
//! Long-running companion process: follows `ctr events` and records
//! `/tasks/exit` statuses in the flag store so `delete` handling and
//! operators can see how containers ended. A PID file next to the state
//! directory keeps it a singleton; the shim spawns it opportunistically on
//! every intercepted command and extra copies exit immediately.

use anyhow::{Context, Result};
use cryo_core::events;
use cryo_core::flags::FlagStore;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{error, info, warn};

const PID_FILE_NAME: &str = "event-listener.pid";

fn main() {
    cryo_core::logging::init();

    if let Err(err) = run() {
        error!(error = %err, "event listener failed");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let store = FlagStore::new().context("failed to open flag store")?;
    let pid_file = pid_file_path(&store);

    if let Some(pid) = live_listener_pid(&pid_file) {
        info!(pid, "event listener already running");
        return Ok(());
    }
    fs::write(&pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", pid_file.display()))?;

    let result = follow_events(&store);

    if let Err(err) = fs::remove_file(&pid_file) {
        warn!(path = %pid_file.display(), error = %err, "failed to remove pid file");
    }
    result
}

fn follow_events(store: &FlagStore) -> Result<()> {
    info!("following supervisor event stream");
    let mut child = Command::new("ctr")
        .arg("events")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn `ctr events`")?;
    let stdout = child
        .stdout
        .take()
        .context("no stdout handle for `ctr events`")?;

    let result = events::follow(store, BufReader::new(stdout));

    let _ = child.kill();
    let _ = child.wait();
    result.context("event stream processing failed")
}

fn pid_file_path(store: &FlagStore) -> PathBuf {
    let state_dir = store.state_dir();
    state_dir
        .parent()
        .unwrap_or(state_dir)
        .join(PID_FILE_NAME)
}

/// PID of a live listener, if the PID file points at a running process
///
/// A stale file (dead PID, unparseable contents) reads as "not running"
/// and simply gets overwritten.
fn live_listener_pid(pid_file: &Path) -> Option<u32> {
    let pid: u32 = fs::read_to_string(pid_file).ok()?.trim().parse().ok()?;
    Path::new("/proc")
        .join(pid.to_string())
        .exists()
        .then_some(pid)
}
