//! The `capture` subcommand.
//!
//! Runs one of the two incident-capture proxies until interrupted:
//! `--mode inbound` is the reverse proxy recording client traffic in front
//! of the service, `--mode proxy` is the forward proxy recording the
//! service's dependency calls. Both append to the same newline-delimited
//! event log format the replay engine consumes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use tokio::net::TcpListener;
use tracing::{error, info};
use url::Url;

use infernosim_core::capture;
use infernosim_core::event::EventLogWriter;
use infernosim_core::orchestrator::normalize_listen_addr;

/// Arguments for `infernosim capture`.
#[derive(Debug, Args)]
pub struct CaptureArgs {
    /// Capture mode.
    #[arg(long, value_enum, default_value = "inbound")]
    pub mode: CaptureMode,

    /// Listen address.
    #[arg(long, default_value = ":8080")]
    pub listen: String,

    /// Forward address host:port (inbound mode).
    #[arg(long, default_value = "")]
    pub forward: String,

    /// Event log file.
    #[arg(long, default_value = "events.log")]
    pub log: PathBuf,
}

/// Which side of the service this proxy wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CaptureMode {
    /// Reverse proxy in front of the service; records inbound traffic.
    Inbound,
    /// Forward proxy behind the service; records outbound dependency calls.
    Proxy,
}

/// Runs the capture agent until SIGINT/SIGTERM.
pub fn run(args: CaptureArgs) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "runtime setup failed");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(serve(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "capture agent failed");
            ExitCode::from(2)
        }
    }
}

async fn serve(args: CaptureArgs) -> Result<()> {
    let logger = Arc::new(
        EventLogWriter::open(&args.log)
            .with_context(|| format!("failed to open event log {}", args.log.display()))?,
    );
    let listen = normalize_listen_addr(&args.listen, ":8080");
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(mode = ?args.mode, addr = %listen, "capture agent starting");

    match args.mode {
        CaptureMode::Inbound => {
            if args.forward.trim().is_empty() {
                bail!("inbound mode requires --forward host:port");
            }
            let target = Url::parse(&format!("http://{}", args.forward.trim()))
                .with_context(|| format!("invalid forward address {:?}", args.forward))?;
            tokio::select! {
                served = capture::run_inbound_proxy(listener, target, logger) => {
                    served.context("inbound proxy failed")?;
                }
                () = shutdown_signal() => info!("shutting down inbound proxy"),
            }
        }
        CaptureMode::Proxy => {
            tokio::select! {
                served = capture::run_forward_proxy(listener, logger) => {
                    served.context("forward proxy failed")?;
                }
                () = shutdown_signal() => info!("shutting down forward proxy"),
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(_) => {
                    let _ = interrupt.await;
                    return;
                }
            };
        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
}
