//! Advisory last-run snapshot.
//!
//! After every replay a small machine-readable snapshot is written next to
//! the working directory; the next invocation reads it to report deltas and
//! to inherit the sustainable envelope when the current run fails. The
//! snapshot is advisory only: an absent or unreadable file simply means "no
//! previous run" and never blocks classification.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::outcome::{Outcome, ReplaySummary};

/// Default snapshot location, relative to the working directory.
pub const SNAPSHOT_FILE: &str = ".infernosim_last_run.json";

/// Persisted aggregate of one replay invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySnapshot {
    /// When the invocation finished.
    pub timestamp: DateTime<Utc>,
    /// Its outcome symbol.
    pub outcome: Outcome,
    /// Concurrent drivers per wave.
    pub fanout: u32,
    /// Achieved inbound rate.
    pub achieved_rps: f64,
    /// Outbound arrivals observed.
    pub outbound_observed: u64,
    /// Outbound arrivals at full coverage.
    pub outbound_target: usize,
    /// Largest injected latency, milliseconds.
    pub max_latency_ms: u64,
}

impl ReplaySnapshot {
    /// Captures the persisted subset of a finalized summary, stamped now.
    #[must_use]
    pub fn from_summary(summary: &ReplaySummary) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome: summary.resolved_outcome(),
            fanout: summary.fanout,
            achieved_rps: summary.achieved_rps,
            outbound_observed: summary.outbound_events_observed,
            outbound_target: summary.target_outbound,
            max_latency_ms: u64::try_from(summary.max_injected_latency.as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

/// Reads the snapshot at `path`. Absent or unreadable snapshots yield
/// `None`.
#[must_use]
pub fn load(path: &Path) -> Option<ReplaySnapshot> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "ignoring unreadable snapshot");
            None
        }
    }
}

/// Writes the snapshot for a finalized summary. Best effort: a write
/// failure is logged, never surfaced.
pub fn save(path: &Path, summary: &ReplaySummary) {
    let snapshot = ReplaySnapshot::from_summary(summary);
    let raw = match serde_json::to_vec_pretty(&snapshot) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "snapshot serialization failed");
            return;
        }
    };
    if let Err(err) = std::fs::write(path, raw) {
        warn!(path = %path.display(), error = %err, "snapshot write failed");
    }
}
