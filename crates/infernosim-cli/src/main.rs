//! InfernoSIM command-line entry point.
//!
//! Two subcommands cover the harness lifecycle: `capture` wraps a live
//! service with recording proxies to produce an incident log pair, and
//! `replay` drives a recorded incident against a fresh service instance
//! while the stub proxy impersonates its dependencies.
//!
//! Diagnostics go to stderr via `tracing` (filterable with `RUST_LOG`);
//! stdout is reserved for the replay summary.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod redirect;

#[derive(Debug, Parser)]
#[command(
    name = "infernosim",
    version,
    about = "Deterministic capture-and-replay harness for networked services"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a captured incident against a fresh service instance.
    Replay(commands::replay::ReplayArgs),
    /// Run a capture proxy in front of (or behind) a live service.
    Capture(commands::capture::CaptureArgs),
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infernosim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Replay(args) => commands::replay::run(args),
        Command::Capture(args) => commands::capture::run(args),
    }
}
