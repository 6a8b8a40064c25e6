//! The `replay` subcommand.
//!
//! Drives the replay orchestrator and owns the process-boundary concerns:
//! snapshot load/save for delta reporting, transparent-redirect rule
//! lifecycle, panic recovery, and the summary artifacts (`replay_result.txt`
//! plus the stdout rendering). The exit code is a total function of the
//! outcome symbol: 0 for a strong pass, 1 for retry-worthy outcomes, 2 for
//! everything needing operator attention.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use tracing::warn;

use infernosim_core::orchestrator::{execute_replay, ReplayPlan};
use infernosim_core::outcome::{Outcome, ReplaySummary};
use infernosim_core::snapshot;

use crate::redirect::RedirectGuard;

/// Setting this variable to `1` switches the stub into transparent mode and
/// installs OS redirect rules for outbound TCP 80/443.
pub const TRANSPARENT_ENV: &str = "INFERNOSIM_TRANSPARENT";

/// Plain-text summary artifact written next to the working directory.
const RESULT_FILE: &str = "replay_result.txt";

/// Arguments for `infernosim replay`.
#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Incident directory (contains inbound.log and outbound.log).
    #[arg(long, default_value = ".")]
    pub incident: PathBuf,

    /// Time scale (forensic replay): 0.1 = 10x faster, 2.0 = 2x slower.
    #[arg(long, default_value_t = 1.0)]
    pub time_scale: f64,

    /// Replay density multiplier (CI/stress): 1 = faithful, 10 = 10x denser.
    #[arg(long, default_value_t = 1.0)]
    pub density: f64,

    /// Minimum gap between replayed requests (prevents busy loops).
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2ms")]
    pub min_gap: Duration,

    /// Number of replay runs.
    #[arg(long, default_value_t = 10)]
    pub runs: u32,

    /// Maximum wall-clock time for replay.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub max_wall_time: Duration,

    /// Maximum idle time without replay progress.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub max_idle_time: Duration,

    /// Maximum number of inbound events to replay (0 = no cap).
    #[arg(long, default_value_t = 0)]
    pub max_events: usize,

    /// Concurrent replay workers per run.
    #[arg(long, default_value_t = 1)]
    pub fanout: u32,

    /// SLO evaluation window; when set, replay fails if target throughput
    /// is not achieved within this duration.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub window: Duration,

    /// Replay target base URL for inbound request playback.
    #[arg(long, default_value = "http://localhost:18080")]
    pub target_base: String,

    /// Replay stub proxy listen address.
    #[arg(long, default_value = ":19000")]
    pub stub_listen: String,

    /// Optional compatibility listen address for apps using a fixed
    /// outbound proxy port.
    #[arg(long, default_value = ":9000")]
    pub stub_compat_listen: String,

    /// Injection rule, e.g. --inject "dep=worldtimeapi.org latency=+200ms".
    /// Repeatable.
    #[arg(long)]
    pub inject: Vec<String>,
}

/// Runs the replay subcommand to completion and returns the process exit
/// code. The summary is always finalized and printed, even when setup
/// fails or the orchestrator panics.
pub fn run(args: ReplayArgs) -> ExitCode {
    let mut summary = ReplaySummary::new();
    summary.previous_run = snapshot::load(Path::new(snapshot::SNAPSHOT_FILE));

    let transparent = std::env::var(TRANSPARENT_ENV).is_ok_and(|v| v == "1");

    let plan = ReplayPlan {
        runs: args.runs,
        time_scale: args.time_scale,
        density: args.density,
        min_gap: args.min_gap,
        max_wall_time: args.max_wall_time,
        max_idle_time: args.max_idle_time,
        max_events: args.max_events,
        inbound_log: args.incident.join("inbound.log"),
        outbound_log: args.incident.join("outbound.log"),
        inject: args.inject,
        target_base: args.target_base,
        stub_listen: args.stub_listen.clone(),
        stub_compat_listen: args.stub_compat_listen,
        fanout: args.fanout,
        window: args.window,
        transparent,
    };

    let mut redirect = None;
    if transparent {
        match RedirectGuard::install(stub_port(&args.stub_listen)) {
            Ok(guard) => redirect = Some(guard),
            Err(err) => {
                summary.record_failure(
                    Outcome::FailInvalidEnv,
                    format!("transparent redirect setup failed: {err}"),
                );
                return finish(&mut summary);
            }
        }
    }

    let executed = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(execute_replay(plan, &mut summary));
        Ok::<(), std::io::Error>(())
    }));
    match executed {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            summary.record_failure(
                Outcome::FailInvalidEnv,
                format!("runtime setup failed: {err}"),
            );
        }
        Err(panic) => {
            // A trapped panic overrides whatever reason was on record; the
            // summary is still finalized and printed.
            summary.primary_failure_reason = format!("panic: {}", panic_message(panic.as_ref()));
            summary.outcome = Some(Outcome::FailInvalidEnv);
        }
    }

    // Redirect rules come out before the summary claims the run is over.
    drop(redirect);
    finish(&mut summary)
}

fn finish(summary: &mut ReplaySummary) -> ExitCode {
    summary.finalize();
    let text = summary.render();
    print!("{text}");
    if let Err(err) = std::fs::write(RESULT_FILE, &text) {
        warn!(error = %err, "failed to write {RESULT_FILE}");
    }
    snapshot::save(Path::new(snapshot::SNAPSHOT_FILE), summary);
    ExitCode::from(summary.exit_status)
}

/// Port the stub will listen on, for the redirect rules.
fn stub_port(listen: &str) -> u16 {
    listen
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(19000)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        args: ReplayArgs,
    }

    #[test]
    fn test_defaults_match_the_agent_surface() {
        let harness = Harness::try_parse_from(["replay"]).unwrap();
        let args = harness.args;
        assert_eq!(args.runs, 10);
        assert_eq!(args.fanout, 1);
        assert_eq!(args.min_gap, Duration::from_millis(2));
        assert_eq!(args.max_wall_time, Duration::from_secs(30));
        assert_eq!(args.max_idle_time, Duration::from_secs(5));
        assert_eq!(args.window, Duration::ZERO);
        assert_eq!(args.target_base, "http://localhost:18080");
        assert_eq!(args.stub_listen, ":19000");
        assert_eq!(args.stub_compat_listen, ":9000");
        assert!(args.inject.is_empty());
    }

    #[test]
    fn test_inject_flag_is_repeatable() {
        let harness = Harness::try_parse_from([
            "replay",
            "--inject",
            "dep=redis latency=+10ms",
            "--inject",
            "dep=worldtimeapi.org timeout=50ms",
            "--window",
            "1s",
        ])
        .unwrap();
        assert_eq!(harness.args.inject.len(), 2);
        assert_eq!(harness.args.window, Duration::from_secs(1));
    }

    #[test]
    fn test_stub_port_extraction() {
        assert_eq!(stub_port(":19000"), 19000);
        assert_eq!(stub_port("127.0.0.1:9000"), 9000);
        assert_eq!(stub_port("garbage"), 19000);
    }
}
