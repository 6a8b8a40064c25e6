//! Outcome classification and the replay summary surface.
//!
//! Every replay reduces to exactly one symbol from a closed taxonomy, picked
//! in a fixed priority order, plus derived fields: the limiting factor, the
//! sustainable envelope (inherited from the last passing run when the
//! current run fails), deltas against the previous run, and a
//! what-was-not-tested list. Exit-code and recommendation mappings are total
//! functions of the symbol.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inject::InjectionsApplied;
use crate::snapshot::ReplaySnapshot;

/// The closed outcome taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// All requested runs completed and dependencies were exercised.
    #[serde(rename = "PASS_STRONG")]
    PassStrong,
    /// Nothing failed outright, but coverage or completion fell short.
    #[serde(rename = "PASS_WEAK")]
    PassWeak,
    /// Configuration or environment fault: bad flags, missing logs, bind
    /// failure, or a trapped panic.
    #[serde(rename = "FAIL_INVALID_ENV")]
    FailInvalidEnv,
    /// No outbound call reached the stub.
    #[serde(rename = "FAIL_NO_COVERAGE")]
    FailNoCoverage,
    /// Transparent mode expected outbound traffic and captured none.
    #[serde(rename = "FAIL_TRANSPARENT_PROXY")]
    FailTransparentProxy,
    /// Throughput target for the requested window was not achieved.
    #[serde(rename = "FAIL_SLO_MISSED")]
    FailSloMissed,
    /// Fingerprints diverged across a multi-run replay.
    #[serde(rename = "FAIL_NON_DETERMINISTIC")]
    FailNonDeterministic,
    /// No run completed and a failure reason is on record.
    #[serde(rename = "FAIL_STALLED")]
    FailStalled,
    /// The stub failed to deliver responses.
    #[serde(rename = "FAIL_PROXY_FORWARDING")]
    FailProxyForwarding,
}

impl Outcome {
    /// Summary-surface spelling of the symbol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PassStrong => "PASS_STRONG",
            Self::PassWeak => "PASS_WEAK",
            Self::FailInvalidEnv => "FAIL_INVALID_ENV",
            Self::FailNoCoverage => "FAIL_NO_COVERAGE",
            Self::FailTransparentProxy => "FAIL_TRANSPARENT_PROXY",
            Self::FailSloMissed => "FAIL_SLO_MISSED",
            Self::FailNonDeterministic => "FAIL_NON_DETERMINISTIC",
            Self::FailStalled => "FAIL_STALLED",
            Self::FailProxyForwarding => "FAIL_PROXY_FORWARDING",
        }
    }

    /// True for both pass grades.
    #[must_use]
    pub const fn is_pass(self) -> bool {
        matches!(self, Self::PassStrong | Self::PassWeak)
    }

    /// True for every `FAIL_*` symbol.
    #[must_use]
    pub const fn is_fail(self) -> bool {
        !self.is_pass()
    }

    /// Process exit code: 0 for a strong pass, 1 for outcomes worth
    /// retrying as-is, 2 for everything that needs operator attention.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::PassStrong => 0,
            Self::PassWeak | Self::FailNonDeterministic | Self::FailSloMissed => 1,
            _ => 2,
        }
    }

    /// Fixed actionable recommendation per symbol.
    #[must_use]
    pub const fn recommendation(self) -> &'static str {
        match self {
            Self::PassStrong => "Keep using replay for regression detection.",
            Self::PassWeak => {
                "Increase coverage by exercising dependencies and completing all runs."
            }
            Self::FailNonDeterministic => {
                "Disable retries and reduce concurrency for deterministic replay."
            }
            Self::FailInvalidEnv => "Fix environment permissions, ports, or configuration and retry.",
            Self::FailProxyForwarding => {
                "Ensure HTTP_PROXY points to the replay stub and outbound forwarding is reachable."
            }
            Self::FailTransparentProxy => {
                "Verify the transparent redirect to the stub port and ensure NET_ADMIN is enabled."
            }
            Self::FailNoCoverage => "Ensure outbound dependencies are reachable and instrumented.",
            Self::FailStalled => "Reduce load or increase timeouts to avoid stalls.",
            Self::FailSloMissed => {
                "Lower fanout or increase window; then inspect app saturation limits and outbound dependency latency."
            }
        }
    }
}

/// Stub listener lifecycle as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Not attempted yet.
    Unknown,
    /// Listener bound and serving.
    Bound,
    /// Bind failed.
    Failed,
}

impl ProxyStatus {
    /// Summary-surface spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Bound => "BOUND",
            Self::Failed => "FAILED",
        }
    }
}

/// What bounded the run, decided by a fixed tree over injected faults and
/// observed-vs-inbound ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitingFactor {
    /// Passing runs have no limiting factor.
    None,
    /// A timeout injection was in force.
    DependencyTimeout,
    /// A latency injection was in force and outbound lagged inbound.
    OutboundDependencyLatency,
    /// The stub was bound yet observed nothing.
    ProxyBackpressure,
    /// Outbound traffic flowed but trailed the inbound rate.
    ConnectionPoolExhaustion,
    /// Nothing else explains the shortfall.
    ApplicationCpu,
}

impl LimitingFactor {
    /// Summary-surface spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::DependencyTimeout => "DEPENDENCY_TIMEOUT",
            Self::OutboundDependencyLatency => "OUTBOUND_DEPENDENCY_LATENCY",
            Self::ProxyBackpressure => "PROXY_BACKPRESSURE",
            Self::ConnectionPoolExhaustion => "CONNECTION_POOL_EXHAUSTION",
            Self::ApplicationCpu => "APPLICATION_CPU",
        }
    }
}

/// Aggregate state of one replay invocation, finalized into the summary
/// surface after all waves finish (or fail to start).
#[derive(Debug)]
pub struct ReplaySummary {
    /// Sticky outcome set by the orchestrator on hard failures; the
    /// classifier fills it in at finalize time otherwise.
    pub outcome: Option<Outcome>,
    /// Requested wave count.
    pub runs_requested: u32,
    /// Waves that started.
    pub runs_executed: u32,
    /// Waves whose drivers all finished clean.
    pub runs_completed: u32,
    /// Total inbound requests completed across all waves and workers.
    pub inbound_events_replayed: usize,
    /// Total stub arrivals across all waves.
    pub outbound_events_observed: u64,
    /// Expected outbound arrivals for the whole invocation.
    pub outbound_events_expected: usize,
    /// Stub listener state.
    pub proxy_status: ProxyStatus,
    /// Which injection classes the rule set exercises.
    pub injections_applied: InjectionsApplied,
    /// Coverage invariant: true iff any outbound call was observed.
    pub dependencies_exercised: bool,
    /// Completed runs counted as deterministic.
    pub deterministic_runs: u32,
    /// Non-zero when any fingerprint diverged from the reference.
    pub non_deterministic_runs: u32,
    /// First failure reason on record; empty when none.
    pub primary_failure_reason: String,
    /// Filled from the outcome at finalize time.
    pub recommendation: &'static str,
    /// Coverage gaps of this invocation.
    pub what_not_tested: Vec<&'static str>,
    /// Process exit code derived from the outcome.
    pub exit_status: u8,
    /// Whether the stub ran behind an OS-level redirect.
    pub transparent_mode: bool,
    /// Concurrent drivers per wave.
    pub fanout: u32,
    /// SLO evaluation window; zero disables the SLO check.
    pub window: Duration,
    /// Inbound requests the invocation was asked to replay in total.
    pub target_inbound: usize,
    /// Outbound arrivals the invocation would produce at full coverage.
    pub target_outbound: usize,
    /// Wall time of the whole invocation.
    pub elapsed: Duration,
    /// `inbound_events_replayed / elapsed`.
    pub achieved_rps: f64,
    /// `target_inbound / window`, when a window is set.
    pub target_rps: f64,
    /// Derived at finalize time.
    pub limiting_factor: LimitingFactor,
    /// Envelope line: max stable inbound rate.
    pub envelope_inbound_rps: String,
    /// Envelope line: max stable fanout.
    pub envelope_fanout: String,
    /// Envelope line: dependency latency tolerance.
    pub envelope_latency: String,
    /// Delta line vs the previous run: fanout.
    pub delta_fanout: String,
    /// Delta line vs the previous run: achieved rate.
    pub delta_rate: String,
    /// Delta line vs the previous run: outbound completion.
    pub delta_outbound: String,
    /// Largest injected latency across the rule set.
    pub max_injected_latency: Duration,
    /// Largest injected timeout across the rule set.
    pub max_injected_timeout: Duration,
    /// Advisory snapshot of the previous invocation, when readable.
    pub previous_run: Option<ReplaySnapshot>,

    lines: Vec<String>,
}

impl Default for ReplaySummary {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplaySummary {
    /// A fresh, undecided summary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            outcome: None,
            runs_requested: 0,
            runs_executed: 0,
            runs_completed: 0,
            inbound_events_replayed: 0,
            outbound_events_observed: 0,
            outbound_events_expected: 0,
            proxy_status: ProxyStatus::Unknown,
            injections_applied: InjectionsApplied::None,
            dependencies_exercised: false,
            deterministic_runs: 0,
            non_deterministic_runs: 0,
            primary_failure_reason: String::new(),
            recommendation: "",
            what_not_tested: Vec::new(),
            exit_status: 0,
            transparent_mode: false,
            fanout: 0,
            window: Duration::ZERO,
            target_inbound: 0,
            target_outbound: 0,
            elapsed: Duration::ZERO,
            achieved_rps: 0.0,
            target_rps: 0.0,
            limiting_factor: LimitingFactor::None,
            envelope_inbound_rps: String::new(),
            envelope_fanout: String::new(),
            envelope_latency: String::new(),
            delta_fanout: String::new(),
            delta_rate: String::new(),
            delta_outbound: String::new(),
            max_injected_latency: Duration::ZERO,
            max_injected_timeout: Duration::ZERO,
            previous_run: None,
            lines: Vec::new(),
        }
    }

    /// The outcome after [`ReplaySummary::finalize`]; a weak pass before.
    #[must_use]
    pub fn resolved_outcome(&self) -> Outcome {
        self.outcome.unwrap_or(Outcome::PassWeak)
    }

    /// Records a hard failure: the reason (first one wins) and a sticky
    /// outcome the classifier will preserve.
    pub fn record_failure(&mut self, outcome: Outcome, reason: impl Into<String>) {
        let reason = reason.into();
        if self.primary_failure_reason.is_empty() {
            self.primary_failure_reason = reason;
        }
        self.outcome = Some(outcome);
    }

    /// Classifies, derives every dependent field, and renders the summary
    /// lines. Idempotent; call once all aggregation is done.
    pub fn finalize(&mut self) {
        let outcome = self.classify();
        self.outcome = Some(outcome);
        self.limiting_factor = self.derive_limiting_factor(outcome);
        self.derive_envelope(outcome);
        self.derive_delta();
        self.recommendation = outcome.recommendation();
        self.what_not_tested = self.compute_what_not_tested();
        self.exit_status = outcome.exit_code();
        self.lines = self.render_lines(outcome);
    }

    /// The finalized summary as printable text, one trailing newline.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }

    /// Picks exactly one outcome symbol, in priority order. A sticky
    /// `FAIL_*` set during execution always wins.
    fn classify(&self) -> Outcome {
        if let Some(outcome) = self.outcome {
            if outcome.is_fail() {
                return outcome;
            }
        }
        if self.proxy_status == ProxyStatus::Failed {
            return Outcome::FailInvalidEnv;
        }
        if self.transparent_mode
            && self.outbound_events_expected > 0
            && self.outbound_events_observed == 0
        {
            return Outcome::FailTransparentProxy;
        }
        if self.outbound_events_observed == 0 {
            return Outcome::FailNoCoverage;
        }
        if self.window > Duration::ZERO && self.inbound_events_replayed < self.target_inbound {
            return Outcome::FailSloMissed;
        }
        if self.runs_executed > 1 && self.non_deterministic_runs > 0 {
            return Outcome::FailNonDeterministic;
        }
        if !self.primary_failure_reason.is_empty() && self.runs_completed == 0 {
            return Outcome::FailStalled;
        }
        if self.runs_completed == self.runs_requested && self.dependencies_exercised {
            return Outcome::PassStrong;
        }
        Outcome::PassWeak
    }

    fn derive_limiting_factor(&self, outcome: Outcome) -> LimitingFactor {
        if outcome.is_pass() {
            return LimitingFactor::None;
        }
        if self.max_injected_timeout > Duration::ZERO {
            return LimitingFactor::DependencyTimeout;
        }
        let observed = self.outbound_events_observed as usize;
        if self.max_injected_latency > Duration::ZERO
            && (observed < self.inbound_events_replayed
                || self.primary_failure_reason.contains("wall-clock"))
        {
            return LimitingFactor::OutboundDependencyLatency;
        }
        if observed == 0 && self.proxy_status == ProxyStatus::Bound {
            return LimitingFactor::ProxyBackpressure;
        }
        if observed > 0 && observed < self.inbound_events_replayed {
            return LimitingFactor::ConnectionPoolExhaustion;
        }
        LimitingFactor::ApplicationCpu
    }

    fn derive_envelope(&mut self, outcome: Outcome) {
        self.envelope_inbound_rps = "unknown".to_string();
        self.envelope_fanout = "unknown".to_string();
        self.envelope_latency = "unknown".to_string();

        if outcome == Outcome::PassStrong {
            self.envelope_inbound_rps = format!("~{:.2} req/s", self.achieved_rps);
            self.envelope_fanout = format!("~{}", self.fanout);
            self.envelope_latency = if self.max_injected_latency > Duration::ZERO {
                format!("~{}", fmt_duration(self.max_injected_latency))
            } else {
                "baseline only (no latency injection in this run)".to_string()
            };
            return;
        }

        // Inherit from the last persisted passing run, when one exists.
        if let Some(prev) = &self.previous_run {
            if prev.outcome.is_pass() {
                self.envelope_inbound_rps =
                    format!("~{:.2} req/s (from previous pass)", prev.achieved_rps);
                self.envelope_fanout = format!("~{} (from previous pass)", prev.fanout);
                if prev.max_latency_ms > 0 {
                    self.envelope_latency =
                        format!("~{}ms (from previous pass)", prev.max_latency_ms);
                }
            }
        }
    }

    fn derive_delta(&mut self) {
        self.delta_fanout = "n/a (no previous run)".to_string();
        self.delta_rate = "n/a (no previous run)".to_string();
        self.delta_outbound = "n/a (no previous run)".to_string();

        let Some(prev) = &self.previous_run else {
            return;
        };

        self.delta_fanout = format!("{:+}", i64::from(self.fanout) - i64::from(prev.fanout));

        if prev.achieved_rps > 0.0 {
            let rate_pct = (self.achieved_rps - prev.achieved_rps) / prev.achieved_rps * 100.0;
            self.delta_rate = format!("{rate_pct:+.1}%");
        }

        let current = completion_ratio(self.outbound_events_observed, self.target_outbound);
        let previous = completion_ratio(prev.outbound_observed, prev.outbound_target);
        if previous > 0.0 {
            let completion_pct = (current - previous) / previous * 100.0;
            self.delta_outbound = format!("{completion_pct:+.1}%");
        }
    }

    fn compute_what_not_tested(&self) -> Vec<&'static str> {
        let mut gaps = Vec::new();
        if self.inbound_events_replayed == 0 {
            gaps.push("No inbound events replayed");
        }
        if self.outbound_events_observed == 0 {
            gaps.push("No outbound calls observed");
        }
        if self.transparent_mode
            && self.outbound_events_expected > 0
            && self.outbound_events_observed == 0
        {
            gaps.push("Transparent redirect did not capture outbound traffic");
        }
        if self.proxy_status != ProxyStatus::Bound {
            gaps.push("Outbound stub proxy not bound");
        }
        if !self.dependencies_exercised {
            gaps.push("Dependencies not exercised");
        }
        if self.injections_applied == InjectionsApplied::None {
            gaps.push("Fault injections not exercised");
        }
        if self.runs_executed < self.runs_requested {
            gaps.push("Not all requested runs executed");
        }
        if self.window > Duration::ZERO && self.inbound_events_replayed < self.target_inbound {
            gaps.push("Replay SLO not met for requested window");
        }
        gaps
    }

    fn render_lines(&self, outcome: Outcome) -> Vec<String> {
        let mut lines = vec![
            "--------------------------------".to_string(),
            "InfernoSIM Replay Summary".to_string(),
            "--------------------------------".to_string(),
            format!("Outcome: {}", outcome.as_str()),
            format!("Runs requested: {}", self.runs_requested),
            format!("Runs executed: {}", self.runs_executed),
            format!("Runs completed: {}", self.runs_completed),
            format!("Fanout: {}", self.fanout),
            format!("Window: {}", fmt_duration(self.window)),
            format!(
                "Deterministic runs: {} / {}",
                self.deterministic_runs, self.runs_executed
            ),
            format!("Inbound events replayed: {}", self.inbound_events_replayed),
            format!("Inbound target: {}", self.target_inbound),
            format!("Outbound events observed: {}", self.outbound_events_observed),
            format!("Outbound events expected: {}", self.outbound_events_expected),
            format!("Outbound target: {}", self.target_outbound),
            format!("Elapsed: {}", fmt_duration_ms(self.elapsed)),
            format!("Achieved rate (req/s): {:.2}", self.achieved_rps),
            format!("Target rate (req/s): {:.2}", self.target_rps),
            format!("Stub proxy status: {}", self.proxy_status.as_str()),
            format!("Injections applied: {}", self.injections_applied.as_str()),
            format!("Dependencies exercised: {}", self.dependencies_exercised),
            format!(
                "Primary failure reason: {}",
                if self.primary_failure_reason.is_empty() {
                    "none"
                } else {
                    &self.primary_failure_reason
                }
            ),
            format!("Actionable recommendation: {}", self.recommendation),
            format!("Limiting factor: {}", self.limiting_factor.as_str()),
            String::new(),
            "SUSTAINABLE ENVELOPE (observed)".to_string(),
            format!("- Max stable inbound rate: {}", self.envelope_inbound_rps),
            format!("- Max stable fanout: {}", self.envelope_fanout),
            format!(
                "- Dependency p95 latency tolerance: {}",
                self.envelope_latency
            ),
            String::new(),
            "Change from last run:".to_string(),
            format!("- Fanout: {}", self.delta_fanout),
            format!("- Achieved rate: {}", self.delta_rate),
            format!("- Outbound completion: {}", self.delta_outbound),
            String::new(),
            "WHAT THIS RUN DID NOT TEST".to_string(),
        ];

        if self.what_not_tested.is_empty() {
            lines.push("- None".to_string());
        } else {
            for gap in &self.what_not_tested {
                lines.push(format!("- {gap}"));
            }
        }
        lines.push("--------------------------------".to_string());
        lines
    }
}

fn completion_ratio(observed: u64, target: usize) -> f64 {
    if target == 0 {
        return 0.0;
    }
    observed as f64 / target as f64
}

/// Compact duration rendering for the summary surface.
fn fmt_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string().replace(' ', "")
}

/// As [`fmt_duration`], rounded down to whole milliseconds.
fn fmt_duration_ms(d: Duration) -> String {
    fmt_duration(Duration::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)))
}
