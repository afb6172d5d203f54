//! Transparent runtime wrapper
//!
//! This binary sits at the runtime's canonical path (installed there by
//! `cryo install`) and receives every invocation the supervisor makes.
//! The lifecycle engine decides what to do; this entry point only owns the
//! single exit: either terminate with the engine's status, or replace the
//! process image with the real runtime so the supervisor's process
//! accounting, signal forwarding, and exit-status plumbing stay intact.

use anyhow::Result;
use cryo_core::lifecycle::{Outcome, ShimEngine};
use cryo_core::locator::RuntimeLocator;
use std::os::unix::process::CommandExt;
use std::process::Command;
use tracing::{debug, error};

fn main() {
    cryo_core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    debug!(argv = ?args, "shim invoked");

    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            // Only pre-opt-in conditions land here: unparseable argv or a
            // missing runtime binary (a misinstallation)
            error!(error = %err, "fatal shim error");
            std::process::exit(1);
        }
    }
}

fn run(args: &[String]) -> Result<i32> {
    let runtime = RuntimeLocator::new().resolve()?;
    let engine = ShimEngine::new(&runtime)?;

    match engine.run(args)? {
        Outcome::Exit(code) => Ok(code),
        Outcome::Exec(argv) => {
            debug!(runtime = %runtime.display(), argv = ?argv, "replacing process image");
            let err = Command::new(&runtime).args(&argv).exec();
            // exec only returns on failure
            Err(err.into())
        }
    }
}
