//! itarget - target management and debug-launch orchestration for iOS
//! simulators and devices
//!
//! This is the binary entry point. All logic lives in the library crates.

mod cli;
mod picker;

use clap::Parser;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    if let Err(e) = itarget_core::logging::init() {
        eprintln!("warning: could not initialize logging: {}", e);
    }

    if let Err(e) = cli::run(args).await {
        tracing::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
