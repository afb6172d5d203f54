mod cli;
mod commands;

use clap::Parser;

fn main() {
    // Logging honors the same env file the CLI administers
    cryo_core::logging::init();

    let parsed = cli::Cli::parse();
    match parsed.dispatch() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(1);
        }
    }
}
