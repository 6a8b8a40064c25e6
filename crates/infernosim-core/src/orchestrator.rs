//! Replay orchestration: waves of concurrent drivers over one shared stub.
//!
//! One invocation runs up to `runs` sequential waves. Each wave resets the
//! stub, reconfigures its cardinality for the wave's fanout, and launches
//! `fanout` concurrent driver workers sharing the same event vector and a
//! decreasing wall-clock budget. Worker fingerprints are compared against
//! the first observed fingerprint; any divergence marks the invocation
//! non-deterministic. The workers never coordinate with each other — the
//! shared stub is the only coordination point.
//!
//! Hard failures (missing logs, invalid rules, bind failures) surface as
//! sticky outcomes on the summary; the wire-level results of each wave are
//! aggregated into the same summary for the classifier to fold at
//! finalize time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::event;
use crate::inject::{self, InjectionsApplied};
use crate::outcome::{Outcome, ProxyStatus, ReplaySummary};
use crate::replay::{self, Fingerprint, ReplayConfig};
use crate::stub::StubProxy;

/// Everything one replay invocation needs, resolved from the surface flags.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    /// Number of sequential waves.
    pub runs: u32,
    /// Gap stretch factor.
    pub time_scale: f64,
    /// Gap compression divisor.
    pub density: f64,
    /// Floor on scheduled inter-request gaps.
    pub min_gap: Duration,
    /// Wall-clock budget shared by all waves.
    pub max_wall_time: Duration,
    /// Per-worker idle bound.
    pub max_idle_time: Duration,
    /// Inbound event cap; zero replays everything.
    pub max_events: usize,
    /// Captured inbound log.
    pub inbound_log: PathBuf,
    /// Captured outbound log.
    pub outbound_log: PathBuf,
    /// Raw injection rule strings.
    pub inject: Vec<String>,
    /// Base URL the drivers replay against.
    pub target_base: String,
    /// Stub listen address.
    pub stub_listen: String,
    /// Optional second stub address for services pinned to a fixed
    /// outbound proxy port; explicit mode only.
    pub stub_compat_listen: String,
    /// Concurrent drivers per wave.
    pub fanout: u32,
    /// SLO window; zero disables the SLO check.
    pub window: Duration,
    /// Serve the stub in transparent-redirect mode.
    pub transparent: bool,
}

/// Runs the full replay plan, aggregating into `summary`.
///
/// Never returns an error: configuration faults and wire failures become
/// sticky outcomes and counters on the summary, which the caller finalizes.
pub async fn execute_replay(plan: ReplayPlan, summary: &mut ReplaySummary) {
    let start = Instant::now();
    summary.runs_requested = plan.runs;
    summary.transparent_mode = plan.transparent;
    if plan.fanout == 0 {
        summary.record_failure(Outcome::FailInvalidEnv, "fanout must be >= 1");
        return;
    }
    summary.fanout = plan.fanout;
    summary.window = plan.window;
    if !(plan.time_scale.is_finite() && plan.time_scale > 0.0) {
        summary.record_failure(
            Outcome::FailInvalidEnv,
            format!("time-scale must be > 0, got {}", plan.time_scale),
        );
        return;
    }
    if !(plan.density.is_finite() && plan.density > 0.0) {
        summary.record_failure(
            Outcome::FailInvalidEnv,
            format!("density must be > 0, got {}", plan.density),
        );
        return;
    }

    for (label, path) in [("Inbound", &plan.inbound_log), ("Outbound", &plan.outbound_log)] {
        if !path.exists() {
            summary.record_failure(
                Outcome::FailInvalidEnv,
                format!("{label} log not found: {}", path.display()),
            );
            return;
        }
    }

    let mut events = match event::load_inbound(&plan.inbound_log) {
        Ok(events) => events,
        Err(err) => {
            summary.record_failure(
                Outcome::FailInvalidEnv,
                format!("Failed to load inbound log: {err}"),
            );
            return;
        }
    };
    if events.is_empty() {
        summary.record_failure(
            Outcome::FailNoCoverage,
            "No inbound requests found in incident",
        );
        return;
    }
    if plan.max_events > 0 && events.len() > plan.max_events {
        events.truncate(plan.max_events);
    }

    let expected_outbound = match event::load_outbound(&plan.outbound_log) {
        Ok(events) => events,
        Err(err) => {
            summary.record_failure(
                Outcome::FailInvalidEnv,
                format!("Failed to load outbound log: {err}"),
            );
            return;
        }
    };
    let expected_per_replay = expected_outbound.len();
    let fanout = plan.fanout as usize;
    summary.target_inbound = events.len() * plan.runs as usize * fanout;
    summary.target_outbound = expected_per_replay * plan.runs as usize * fanout;
    summary.outbound_events_expected = summary.target_outbound;

    let rules = match inject::parse_rules(&plan.inject) {
        Ok(rules) => rules,
        Err(err) => {
            summary.record_failure(Outcome::FailInvalidEnv, format!("Invalid injection: {err}"));
            return;
        }
    };
    summary.injections_applied = InjectionsApplied::from_rules(&rules);
    summary.max_injected_latency = rules
        .iter()
        .map(|r| r.add_latency)
        .max()
        .unwrap_or(Duration::ZERO);
    summary.max_injected_timeout = rules
        .iter()
        .map(|r| r.timeout)
        .max()
        .unwrap_or(Duration::ZERO);

    // Observed replay traffic is never appended to the captured incident.
    let stub = Arc::new(StubProxy::new(expected_outbound, rules));

    let stub_addr = normalize_listen_addr(&plan.stub_listen, ":19000");
    let listener = match TcpListener::bind(&stub_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            summary.proxy_status = ProxyStatus::Failed;
            summary.record_failure(
                Outcome::FailInvalidEnv,
                format!("Stub proxy bind failed on {stub_addr}: {err}"),
            );
            return;
        }
    };
    summary.proxy_status = ProxyStatus::Bound;
    info!(addr = %stub_addr, transparent = plan.transparent, "stub proxy active");

    let mut server_tasks = Vec::new();
    {
        let stub = Arc::clone(&stub);
        let transparent = plan.transparent;
        server_tasks.push(tokio::spawn(async move {
            let served = if transparent {
                stub.serve_transparent(listener).await
            } else {
                stub.serve_explicit(listener).await
            };
            if let Err(err) = served {
                warn!(error = %err, "stub proxy accept loop ended");
            }
        }));
    }
    if !plan.transparent && !plan.stub_compat_listen.trim().is_empty() {
        let compat_addr = normalize_listen_addr(&plan.stub_compat_listen, "");
        if compat_addr != stub_addr {
            match TcpListener::bind(&compat_addr).await {
                Ok(compat_listener) => {
                    info!(addr = %compat_addr, "stub proxy compat listener active");
                    let stub = Arc::clone(&stub);
                    server_tasks.push(tokio::spawn(async move {
                        if let Err(err) = stub.serve_explicit(compat_listener).await {
                            warn!(error = %err, "stub compat accept loop ended");
                        }
                    }));
                }
                // Never fatal: the compat port is a convenience for apps
                // pinned to a fixed proxy address.
                Err(err) => info!(addr = %compat_addr, error = %err, "stub compat listen skipped"),
            }
        }
    }

    let events = Arc::new(events);
    let target_base = plan.target_base.trim_end_matches('/').to_string();
    let mut reference: Option<Fingerprint> = None;
    let mut non_deterministic = false;

    for run in 0..plan.runs {
        stub.reset();
        stub.configure_replay_cardinality(plan.fanout > 1, (expected_per_replay * fanout) as u64);

        let elapsed = start.elapsed();
        if elapsed >= plan.max_wall_time {
            if summary.primary_failure_reason.is_empty() {
                summary.primary_failure_reason =
                    "Replay exceeded max wall time before run start".to_string();
            }
            break;
        }
        let remaining = plan.max_wall_time - elapsed;

        let wave_started = Instant::now();
        let mut workers = JoinSet::new();
        for _ in 0..plan.fanout {
            let events = Arc::clone(&events);
            let target_base = target_base.clone();
            let cfg = ReplayConfig {
                time_scale: plan.time_scale,
                density: plan.density,
                min_gap: plan.min_gap,
                max_wall_clock: remaining,
                max_idle_time: plan.max_idle_time,
                max_events: plan.max_events,
            };
            workers.spawn(async move { replay::replay_events(&events, &target_base, &cfg).await });
        }
        summary.runs_executed += 1;

        let mut wave_complete = true;
        let mut wave_inbound = 0usize;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    summary.record_failure(Outcome::FailStalled, format!("Replay failed: {err}"));
                    wave_complete = false;
                    continue;
                }
                Err(err) => {
                    summary.record_failure(
                        Outcome::FailInvalidEnv,
                        format!("panic in replay worker: {err}"),
                    );
                    wave_complete = false;
                    continue;
                }
            };
            if let Some(reason) = result
                .time_expanded
                .as_deref()
                .or(result.stalled.as_deref())
            {
                summary.record_failure(Outcome::FailStalled, reason);
                wave_complete = false;
            }
            wave_inbound += result.completed_events;
            match reference {
                None => reference = Some(result.fingerprint),
                Some(fp) if fp != result.fingerprint => {
                    warn!(
                        reference = %replay::fingerprint_hex(&fp),
                        observed = %replay::fingerprint_hex(&result.fingerprint),
                        "fingerprint divergence"
                    );
                    non_deterministic = true;
                }
                Some(_) => {}
            }
        }

        summary.inbound_events_replayed += wave_inbound;
        summary.outbound_events_observed += stub.observed_count();
        summary.dependencies_exercised = summary.outbound_events_observed > 0;
        if stub.forward_errors() > 0 {
            summary.record_failure(Outcome::FailProxyForwarding, "Proxy forwarding failed");
            break;
        }

        debug!(
            run = run + 1,
            inbound = wave_inbound,
            outbound = stub.observed_count(),
            wall_ms = wave_started.elapsed().as_millis() as u64,
            complete = wave_complete,
            "wave finished"
        );
        if wave_complete {
            summary.runs_completed += 1;
        } else {
            break;
        }
    }

    summary.elapsed = start.elapsed();
    if summary.elapsed > Duration::ZERO {
        summary.achieved_rps =
            summary.inbound_events_replayed as f64 / summary.elapsed.as_secs_f64();
    }
    if plan.window > Duration::ZERO {
        summary.target_rps = summary.target_inbound as f64 / plan.window.as_secs_f64();
        if summary.inbound_events_replayed < summary.target_inbound
            || summary.elapsed > plan.window
        {
            let elapsed_ms = Duration::from_millis(summary.elapsed.as_millis() as u64);
            summary.record_failure(
                Outcome::FailSloMissed,
                format!(
                    "SLO miss: inbound replayed {}/{} in {} (window {}, achieved {:.2} req/s, target {:.2} req/s)",
                    summary.inbound_events_replayed,
                    summary.target_inbound,
                    humantime::format_duration(elapsed_ms),
                    humantime::format_duration(plan.window),
                    summary.achieved_rps,
                    summary.target_rps,
                ),
            );
        }
    }

    if summary.runs_executed > 1 && non_deterministic {
        summary.non_deterministic_runs = 1;
        if summary.primary_failure_reason.is_empty() {
            summary.primary_failure_reason = "Non-deterministic fingerprints observed".to_string();
        }
    } else {
        summary.deterministic_runs = summary.runs_completed;
    }

    // Teardown in reverse order of opening; the accept tasks own the
    // listeners.
    for task in server_tasks.into_iter().rev() {
        task.abort();
    }
}

/// Expands a bare `:port` listen address to a bindable form, falling back
/// to `fallback` when `addr` is blank.
#[must_use]
pub fn normalize_listen_addr(addr: &str, fallback: &str) -> String {
    let addr = addr.trim();
    let addr = if addr.is_empty() { fallback } else { addr };
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}
