//! End-to-end shim behavior against a scripted runtime
//!
//! Scenarios covered:
//! - pass-through for global-only, non-intercepted, and non-opted-in argv
//! - exit status propagation through the process-image replacement
//! - fatal exit when no real runtime is resolvable
//!
//! The "real runtime" is a shell script that records its argv, so the
//! tests observe exactly what the supervisor would have received.

use assert_cmd::Command;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Install a fake runc that records its argv and exits with `exit_code`
fn fake_runc(dir: &Path, exit_code: i32) -> (PathBuf, PathBuf) {
    let log = dir.join("runc.log");
    let path = dir.join("runc.real");
    fs::write(
        &path,
        format!(
            "#!/bin/sh\necho \"$@\" >> {}\necho \"fake-runc ok\"\nexit {}\n",
            log.display(),
            exit_code
        ),
    )
    .unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    (path, log)
}

fn shim(tmp: &TempDir, runc: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cryo-shim").unwrap();
    cmd.env("CRYO_REAL_RUNC_CMD", runc)
        .env("CRYO_STATE_DIR", tmp.path().join("state"))
        .env("CRYO_ENV_FILE", tmp.path().join("cryo.env"));
    cmd
}

#[test]
fn global_only_invocation_reaches_the_real_runtime() {
    let tmp = TempDir::new().unwrap();
    let (runc, log) = fake_runc(tmp.path(), 0);

    shim(&tmp, &runc)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("fake-runc ok"));

    let recorded = fs::read_to_string(&log).unwrap();
    assert_eq!(recorded.trim(), "--version");
}

#[test]
fn non_intercepted_subcommand_passes_through_verbatim() {
    let tmp = TempDir::new().unwrap();
    let (runc, log) = fake_runc(tmp.path(), 0);

    shim(&tmp, &runc)
        .args(["--root", "/run/containerd/runc/default", "list", "--format", "json"])
        .assert()
        .success();

    let recorded = fs::read_to_string(&log).unwrap();
    assert_eq!(
        recorded.trim(),
        "--root /run/containerd/runc/default list --format json"
    );
}

#[test]
fn intercepted_subcommand_for_unknown_container_passes_through() {
    let tmp = TempDir::new().unwrap();
    let (runc, log) = fake_runc(tmp.path(), 0);

    // No config.json anywhere on this host, so the container is not opted
    // in and create flows straight to the runtime
    shim(&tmp, &runc)
        .args(["create", "--bundle", "/b", "tc"])
        .assert()
        .success();

    let recorded = fs::read_to_string(&log).unwrap();
    assert_eq!(recorded.trim(), "create --bundle /b tc");

    // No flag record appeared
    let state_entries: Vec<_> = fs::read_dir(tmp.path().join("state"))
        .map(|entries| entries.collect())
        .unwrap_or_default();
    assert!(state_entries.is_empty());
}

#[test]
fn runtime_exit_status_propagates_through_exec() {
    let tmp = TempDir::new().unwrap();
    let (runc, _log) = fake_runc(tmp.path(), 3);

    shim(&tmp, &runc)
        .args(["state", "tc"])
        .assert()
        .code(3);
}

#[test]
fn missing_real_runtime_is_fatal() {
    let tmp = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("cryo-shim").unwrap();
    cmd.env_remove("CRYO_REAL_RUNC_CMD")
        .env("CRYO_STATE_DIR", tmp.path().join("state"))
        .env("CRYO_ENV_FILE", tmp.path().join("absent.env"))
        .arg("--version")
        .assert()
        .code(1);
}

#[test]
fn runtime_resolution_from_env_file_works() {
    let tmp = TempDir::new().unwrap();
    let (runc, log) = fake_runc(tmp.path(), 0);
    let env_file = tmp.path().join("cryo.env");
    fs::write(
        &env_file,
        format!("CRYO_REAL_RUNC_CMD={}\n", runc.display()),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("cryo-shim").unwrap();
    cmd.env_remove("CRYO_REAL_RUNC_CMD")
        .env("CRYO_STATE_DIR", tmp.path().join("state"))
        .env("CRYO_ENV_FILE", &env_file)
        .args(["events", "tc"])
        .assert()
        .success();

    assert_eq!(fs::read_to_string(&log).unwrap().trim(), "events tc");
}
