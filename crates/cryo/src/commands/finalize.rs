//! Finalize live opted-in containers
//!
//! Walks every flag record, and for each container the runtime still
//! reports as `running`, checkpoints it through the supervisor's `ctr`
//! tool and tears the task and container down. Used before node shutdown
//! so opted-in workloads can restore elsewhere.

use anyhow::{bail, Context, Result};
use cryo_core::flags::FlagStore;
use cryo_core::locator::RuntimeLocator;
use cryo_core::runtime_state::RuntimeStateProbe;
use std::process::Command;
use tracing::{info, warn};

pub fn run() -> Result<i32> {
    let flags = FlagStore::new().context("failed to open flag store")?;
    let containers = flags.list().context("failed to enumerate flag records")?;
    if containers.is_empty() {
        info!("no opted-in containers found");
        return Ok(0);
    }

    let runtime = RuntimeLocator::new()
        .resolve()
        .context("cannot resolve real runtime")?;
    let probe = RuntimeStateProbe::new(runtime);

    info!(count = containers.len(), "finalizing opted-in containers");
    let mut success = true;
    for (namespace, container_id) in containers {
        match finalize_container(&probe, &namespace, &container_id) {
            Ok(true) => {
                info!(namespace = %namespace, container_id = %container_id, "finalized container");
            }
            Ok(false) => {
                info!(
                    namespace = %namespace,
                    container_id = %container_id,
                    "container not running, skipped"
                );
            }
            Err(err) => {
                warn!(
                    namespace = %namespace,
                    container_id = %container_id,
                    error = %err,
                    "failed to finalize container"
                );
                success = false;
            }
        }
    }

    Ok(if success { 0 } else { 1 })
}

/// Checkpoint and remove one container; `Ok(false)` means it was skipped
fn finalize_container(
    probe: &RuntimeStateProbe,
    namespace: &str,
    container_id: &str,
) -> Result<bool> {
    let state = probe.query(namespace, container_id)?;
    if !state.is_running() {
        return Ok(false);
    }

    run_ctr(
        namespace,
        &[
            "containers",
            "checkpoint",
            "--task",
            container_id,
            &format!("checkpoint/{}", container_id),
        ],
    )?;
    run_ctr(namespace, &["task", "kill", container_id])?;
    run_ctr(namespace, &["task", "rm", container_id])?;
    run_ctr(namespace, &["container", "rm", container_id])?;
    Ok(true)
}

fn run_ctr(namespace: &str, args: &[&str]) -> Result<()> {
    info!(namespace = %namespace, args = ?args, "running ctr");
    let output = Command::new("ctr")
        .arg("--namespace")
        .arg(namespace)
        .args(args)
        .output()
        .context("failed to run ctr")?;
    if !output.status.success() {
        bail!(
            "ctr {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
