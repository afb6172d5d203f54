use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::commands;

#[derive(Parser, Debug)]
#[command(
    name = "cryo",
    version,
    about = "Administer the cryo checkpoint/restore shim",
    long_about = "Administer the cryo checkpoint/restore shim.\n\n\
        The shim itself mimics the container runtime transparently; this tool\n\
        covers everything around it: installing the binary swap, finalizing\n\
        live opted-in containers, and adjusting the logger."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Container operations
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },
    /// Update the logger configuration in the host env file
    Log {
        /// Log level to record
        #[arg(long, value_enum, ignore_case = true)]
        level: Option<LogLevel>,
        /// Log file path (made absolute before saving)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Install the shim over the host runtime binary (requires root)
    Install,
    /// Restore the original runtime binary (requires root)
    Uninstall,
}

#[derive(Subcommand, Debug)]
enum ContainerCommands {
    /// Checkpoint and remove every running opted-in container
    Finalize,
}

/// Logger levels accepted by `cryo log`
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Uppercase spelling stored in the env file
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl Cli {
    /// Run the selected command, returning the process exit code
    pub fn dispatch(self) -> Result<i32> {
        match self.command {
            Some(Commands::Container {
                command: ContainerCommands::Finalize,
            }) => commands::finalize::run(),
            Some(Commands::Log { level, file }) => commands::log::run(level, file),
            Some(Commands::Install) => commands::install::install(),
            Some(Commands::Uninstall) => commands::install::uninstall(),
            None => {
                Cli::command().print_help()?;
                Ok(1)
            }
        }
    }
}
