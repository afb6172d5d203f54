//! Lifecycle interception engine
//!
//! One engine instance lives for one shim invocation. It decides whether
//! the invocation is interesting (intercepted subcommand + opted-in
//! container) and, if so, drives the checkpoint/restore machinery; in
//! every other case, and on every failure past the opt-in check, it
//! degrades to handing the untouched argv back to the real runtime.
//!
//! That degradation is the engine's one hard rule: a misbehaving shim must
//! look like no shim at all, never like a broken runtime. Handlers return
//! an [`Outcome`] instead of exiting or exec'ing themselves so the binary
//! has a single exit point and the fallback argv can never get lost.

use crate::checkpoint;
use crate::command::{push_options, RuncCommand};
use crate::container_config::ContainerConfigHandler;
use crate::errors::Result;
use crate::flags::FlagStore;
use crate::overlay::OverlayProbe;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// What the shim process should do once the engine returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Terminate with this status; the interception ran to completion
    Exit(i32),
    /// Replace the process image with the real runtime and this argv
    Exec(Vec<String>),
}

/// The per-invocation interception engine
pub struct ShimEngine {
    runtime_path: PathBuf,
    config: ContainerConfigHandler,
    overlay: OverlayProbe,
    flags: FlagStore,
    listener_bin: Option<PathBuf>,
}

impl ShimEngine {
    /// Engine wired to the production component locations
    pub fn new<P: Into<PathBuf>>(runtime_path: P) -> Result<Self> {
        Ok(Self {
            runtime_path: runtime_path.into(),
            config: ContainerConfigHandler::new(),
            overlay: OverlayProbe::new(),
            flags: FlagStore::new()?,
            listener_bin: sibling_listener_binary(),
        })
    }

    /// Engine with explicit components; the event listener stays disabled
    pub fn with_components<P: Into<PathBuf>>(
        runtime_path: P,
        config: ContainerConfigHandler,
        overlay: OverlayProbe,
        flags: FlagStore,
    ) -> Self {
        Self {
            runtime_path: runtime_path.into(),
            config,
            overlay,
            flags,
            listener_bin: None,
        }
    }

    /// Process one invocation
    ///
    /// Errors only before the opt-in check (empty argv); afterwards every
    /// failure collapses into `Outcome::Exec` with the original argv.
    pub fn run(&self, args: &[String]) -> Result<Outcome> {
        let cmd = RuncCommand::parse(args)?;
        let original: Vec<String> = args[1..].to_vec();

        if !cmd.is_intercepted() {
            debug!(subcommand = %cmd.subcommand, "subcommand not intercepted, passing through");
            return Ok(Outcome::Exec(original));
        }
        if !self
            .config
            .is_cryo_enabled(&cmd.namespace, &cmd.container_id)
        {
            debug!(container_id = %cmd.container_id, "container not opted in, passing through");
            return Ok(Outcome::Exec(original));
        }

        info!(
            subcommand = %cmd.subcommand,
            namespace = %cmd.namespace,
            container_id = %cmd.container_id,
            "intercepting command"
        );
        self.ensure_event_listener();

        // The flag record carries state to the sibling invocation that
        // follows this one. `create` resets it; the mid-lifecycle commands
        // tolerate a missing record; `delete` checks for one itself.
        match cmd.subcommand.as_str() {
            "create" => {
                if let Err(err) = self.flags.create(&cmd.namespace, &cmd.container_id) {
                    warn!(error = %err, "failed to create flag record, passing through");
                    return Ok(Outcome::Exec(original));
                }
            }
            "start" | "checkpoint" | "resume" => {
                if !self.flags.exists(&cmd.namespace, &cmd.container_id) {
                    if let Err(err) = self.flags.create(&cmd.namespace, &cmd.container_id) {
                        warn!(error = %err, "failed to create flag record, passing through");
                        return Ok(Outcome::Exec(original));
                    }
                }
            }
            _ => {}
        }

        Ok(match cmd.subcommand.as_str() {
            "create" => self.handle_create(&cmd, original),
            "start" => self.handle_start(&cmd, original),
            "checkpoint" => self.handle_checkpoint(&cmd, original),
            "resume" => self.handle_resume(&cmd, original),
            "delete" => self.handle_delete(&cmd, original),
            _ => Outcome::Exec(original),
        })
    }

    /// `create`: try to restore from a prior checkpoint instead
    fn handle_create(&self, cmd: &RuncCommand, original: Vec<String>) -> Outcome {
        let (namespace, id) = (&cmd.namespace, &cmd.container_id);

        let Some(checkpoint_path) = self.config.checkpoint_path(namespace, id) else {
            debug!(container_id = %id, "no checkpoint path resolvable, passing through");
            return Outcome::Exec(original);
        };
        let Some(upperdir) = self.overlay.upperdir(id) else {
            warn!(container_id = %id, "could not determine upperdir, passing through");
            return Outcome::Exec(original);
        };

        match self.config.add_bind_mount(namespace, id) {
            Ok(true) => {}
            Ok(false) => {
                warn!(container_id = %id, "bind mount preconditions unmet, passing through");
                return Outcome::Exec(original);
            }
            Err(err) => {
                warn!(container_id = %id, error = %err, "bind mount failed, passing through");
                return Outcome::Exec(original);
            }
        }

        if !checkpoint::validate(&checkpoint_path) {
            info!(container_id = %id, "no valid checkpoint, proceeding with create");
            return Outcome::Exec(original);
        }

        if let Err(err) = checkpoint::restore(&checkpoint_path, &upperdir) {
            warn!(container_id = %id, error = %err, "file restore failed, rolling back");
            self.rollback_upperdir(&upperdir);
            return Outcome::Exec(original);
        }

        // The restore child is spawned, not exec'd: its exit status decides
        // whether the skip_start latch may be set.
        let restore_argv = build_restore_command(cmd, &checkpoint_path);
        info!(container_id = %id, "restoring container from checkpoint");
        debug!(argv = ?restore_argv, "restore command");
        match Command::new(&self.runtime_path).args(&restore_argv).status() {
            Ok(status) if status.success() => {
                if let Err(err) = self.flags.set_skip_start(namespace, id, true) {
                    warn!(container_id = %id, error = %err, "failed to latch skip_start");
                    self.rollback_upperdir(&upperdir);
                    return Outcome::Exec(original);
                }
                info!(container_id = %id, "container restored");
                Outcome::Exit(0)
            }
            Ok(status) => {
                warn!(
                    container_id = %id,
                    status = ?status.code(),
                    "restore child failed, falling back to create"
                );
                self.rollback_upperdir(&upperdir);
                Outcome::Exec(original)
            }
            Err(err) => {
                warn!(container_id = %id, error = %err, "could not spawn restore child");
                self.rollback_upperdir(&upperdir);
                Outcome::Exec(original)
            }
        }
    }

    /// `start`: a successful restore already started the container
    fn handle_start(&self, cmd: &RuncCommand, original: Vec<String>) -> Outcome {
        match self
            .flags
            .consume_skip_start(&cmd.namespace, &cmd.container_id)
        {
            Ok(true) => {
                info!(container_id = %cmd.container_id, "restore already started container");
                Outcome::Exit(0)
            }
            Ok(false) => Outcome::Exec(original),
            Err(err) => {
                warn!(container_id = %cmd.container_id, error = %err, "skip_start check failed");
                Outcome::Exec(original)
            }
        }
    }

    /// `checkpoint`: capture the writable layer, then hand the runtime a
    /// checkpoint command pointed at our image path
    fn handle_checkpoint(&self, cmd: &RuncCommand, original: Vec<String>) -> Outcome {
        let (namespace, id) = (&cmd.namespace, &cmd.container_id);

        let Some(checkpoint_path) = self.config.checkpoint_path(namespace, id) else {
            debug!(container_id = %id, "no checkpoint path resolvable, passing through");
            return Outcome::Exec(original);
        };
        let Some(upperdir) = self.overlay.upperdir(id) else {
            warn!(container_id = %id, "could not determine upperdir, passing through");
            return Outcome::Exec(original);
        };

        if let Err(err) = checkpoint::save(&upperdir, &checkpoint_path) {
            warn!(container_id = %id, error = %err, "failed to save container files");
            return Outcome::Exec(original);
        }

        if let Err(err) = self.flags.mark_checkpointed(namespace, id) {
            warn!(container_id = %id, error = %err, "failed to latch checkpoint flags");
            return Outcome::Exec(original);
        }

        info!(
            container_id = %id,
            checkpoint = %checkpoint_path.display(),
            "container files saved, handing checkpoint to runtime"
        );
        Outcome::Exec(build_checkpoint_command(cmd, &checkpoint_path))
    }

    /// `resume`: symmetric to `start`
    fn handle_resume(&self, cmd: &RuncCommand, original: Vec<String>) -> Outcome {
        match self
            .flags
            .consume_skip_resume(&cmd.namespace, &cmd.container_id)
        {
            Ok(true) => {
                info!(
                    container_id = %cmd.container_id,
                    "checkpoint left container paused, skipping resume"
                );
                Outcome::Exit(0)
            }
            Ok(false) => Outcome::Exec(original),
            Err(err) => {
                warn!(container_id = %cmd.container_id, error = %err, "skip_resume check failed");
                Outcome::Exec(original)
            }
        }
    }

    /// `delete`: reclaim storage unless a checkpoint handoff is pending
    fn handle_delete(&self, cmd: &RuncCommand, original: Vec<String>) -> Outcome {
        let (namespace, id) = (&cmd.namespace, &cmd.container_id);

        if !self.flags.exists(namespace, id) {
            debug!(container_id = %id, "no flag record, passing delete through");
            return Outcome::Exec(original);
        }

        if !self.flags.keep_resources(namespace, id) {
            if let Some(checkpoint_path) = self.config.checkpoint_path(namespace, id) {
                if let Err(err) = checkpoint::cleanup(&checkpoint_path) {
                    warn!(container_id = %id, error = %err, "failed to clean up checkpoint");
                }
            }
            if !self.config.delete_work_directory(namespace, id) {
                warn!(container_id = %id, "failed to delete work directory");
            }
        } else {
            info!(container_id = %id, "keep_resources set, preserving checkpoint and scratch");
        }

        if let Err(err) = self.flags.remove(namespace, id) {
            warn!(container_id = %id, error = %err, "failed to remove flag record");
        }

        Outcome::Exec(original)
    }

    fn rollback_upperdir(&self, upperdir: &Path) {
        if let Err(err) = checkpoint::rollback(upperdir) {
            warn!(upperdir = %upperdir.display(), error = %err, "rollback failed");
        }
    }

    /// Best-effort spawn of the event listener
    ///
    /// The listener holds a PID-file singleton, so spawning on every
    /// intercepted command is harmless. Failure to spawn only costs exit
    /// codes in flag records, never the interception itself.
    fn ensure_event_listener(&self) {
        let Some(listener) = &self.listener_bin else {
            return;
        };
        match Command::new(listener)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => debug!(pid = child.id(), "spawned event listener"),
            Err(err) => warn!(error = %err, "failed to spawn event listener"),
        }
    }
}

/// Locate `cryo-events` next to the current executable
fn sibling_listener_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let listener = exe.parent()?.join("cryo-events");
    listener.exists().then_some(listener)
}

/// Restore command for the real runtime: original global and subcommand
/// options, our image path, and a guaranteed `--detach`
fn build_restore_command(cmd: &RuncCommand, checkpoint_path: &Path) -> Vec<String> {
    let mut argv = Vec::new();
    push_options(&mut argv, &cmd.global_options);
    argv.push("restore".to_string());
    push_options(&mut argv, &cmd.subcommand_options);
    argv.push("--image-path".to_string());
    argv.push(checkpoint_path.display().to_string());
    if !cmd.subcommand_options.contains_key("--detach") {
        argv.push("--detach".to_string());
    }
    argv.push(cmd.container_id.clone());
    argv
}

/// Checkpoint command for the real runtime: drop `--work-path` and
/// `--leave-running`, force our image path
fn build_checkpoint_command(cmd: &RuncCommand, checkpoint_path: &Path) -> Vec<String> {
    let mut argv = Vec::new();
    push_options(&mut argv, &cmd.global_options);
    argv.push("checkpoint".to_string());

    let mut has_image_path = false;
    for (option, value) in &cmd.subcommand_options {
        if option == "--work-path" || option == "--leave-running" {
            continue;
        }
        if option == "--image-path" {
            argv.push(option.clone());
            argv.push(checkpoint_path.display().to_string());
            has_image_path = true;
            continue;
        }
        argv.push(option.clone());
        if !value.is_empty() {
            argv.push(value.clone());
        }
    }
    if !has_image_path {
        argv.push("--image-path".to_string());
        argv.push(checkpoint_path.display().to_string());
    }
    argv.push(cmd.container_id.clone());
    argv
}
