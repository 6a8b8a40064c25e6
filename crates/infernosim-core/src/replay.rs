//! Deterministic, time-scaled replay driver.
//!
//! The driver reissues a captured inbound request sequence against a target
//! base URL. Scheduling anchors on the first event's timestamp: each
//! inter-event gap is clamped to be non-negative, scaled by
//! `time_scale / density`, floored at `min_gap`, and accumulated into an
//! absolute `next_at` instant so drift never compounds. `density` compresses
//! time, `time_scale` stretches it; a 1x1 replay preserves the original
//! inter-arrivals while a CI stress run can collapse an incident to seconds.
//!
//! The driver is sequential: one request at a time, in file order. Its
//! product is a [`ReplayResult`] whose fingerprint is a SHA-256 digest over
//! the ordered response signatures (`<METHOD> <PATH> <STATUS>` on success,
//! `<METHOD> <PATH> ERR:<class>` on failure). Wall time, response bodies,
//! and header order never enter the digest, so two replays against a
//! functionally equivalent target produce identical fingerprints. Transient
//! request failures are folded into a small closed set of error classes for
//! the same reason: identical dependency failures must not look
//! non-deterministic.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::event::Event;

/// Client-side ceiling on any single replayed request. When
/// `max_idle_time` is smaller it becomes the effective per-call bound: a
/// request still pending at the idle deadline ends the run with a stall
/// verdict instead of an error signature.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// 32-byte digest over one worker's ordered response signatures.
pub type Fingerprint = [u8; 32];

/// Renders a fingerprint as lowercase hex for diagnostics.
#[must_use]
pub fn fingerprint_hex(fp: &Fingerprint) -> String {
    fp.iter().map(|b| format!("{b:02x}")).collect()
}

/// Driver configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Stretches inter-event gaps; must be finite and > 0.
    pub time_scale: f64,
    /// Compresses inter-event gaps; must be finite and > 0.
    pub density: f64,
    /// Floor on the scheduled gap between consecutive requests.
    pub min_gap: Duration,
    /// Wall-clock budget for the whole run; zero means unbounded.
    pub max_wall_clock: Duration,
    /// Finish with a stall verdict when no request completes within this
    /// window; zero disables the check.
    pub max_idle_time: Duration,
    /// Truncates the input vector before scheduling; zero means all events.
    pub max_events: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            density: 1.0,
            min_gap: Duration::ZERO,
            max_wall_clock: Duration::ZERO,
            max_idle_time: Duration::ZERO,
            max_events: 0,
        }
    }
}

/// The product of one driver run.
///
/// Safety-bound expiries are normal return states, not errors: a run that
/// hits its wall-clock or idle bound returns partial counters with the
/// corresponding reason set. `fingerprint` is all zeroes for such partial
/// runs; it is only defined over a completed signature sequence.
#[derive(Debug, Clone, Default)]
pub struct ReplayResult {
    /// Digest over `response_signatures`, in order.
    pub fingerprint: Fingerprint,
    /// Requests completed (success or error).
    pub completed_events: usize,
    /// Events scheduled after `max_events` truncation.
    pub total_events: usize,
    /// Index just past the last event that made progress.
    pub last_progress_index: usize,
    /// Observed wall time of the run.
    pub run_duration: Duration,
    /// Sum of scheduled gaps for the truncated input.
    pub expected_duration: Duration,
    /// One signature per completed request, in issue order.
    pub response_signatures: Vec<String>,
    /// Requests that completed with a transport error.
    pub error_count: usize,
    /// `Some(reason)` when the wall-clock bound fired.
    pub time_expanded: Option<String>,
    /// `Some(reason)` when the idle bound fired.
    pub stalled: Option<String>,
}

/// Configuration faults that abort a replay before any request is issued.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// `time_scale` outside `(0, inf)`.
    #[error("time-scale must be a finite value > 0, got {0}")]
    InvalidTimeScale(f64),

    /// `density` outside `(0, inf)`.
    #[error("density must be a finite value > 0, got {0}")]
    InvalidDensity(f64),

    /// The (truncated) event vector is empty.
    #[error("no inbound requests to replay")]
    NoEvents,

    /// A captured URL does not parse even as a relative reference.
    #[error("captured url {url:?} does not parse: {source}")]
    BadUrl {
        /// The offending captured URL.
        url: String,
        /// Parser diagnostic.
        #[source]
        source: url::ParseError,
    },

    /// A captured method is not a valid HTTP method token.
    #[error("captured method {0:?} is not a valid http method")]
    BadMethod(String),

    /// The HTTP client could not be constructed.
    #[error("failed to construct http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Sum of the scheduled gaps for `events` under the given scaling.
///
/// The first event contributes a zero raw gap, which the `min_gap` floor
/// still applies to. With `time_scale = density = 1` and `min_gap = 0` this
/// is exactly the sum of clamped inter-event gaps of the input.
#[must_use]
pub fn expected_duration(
    events: &[Event],
    time_scale: f64,
    density: f64,
    min_gap: Duration,
) -> Duration {
    let Some(first) = events.first() else {
        return Duration::ZERO;
    };
    let mut prev_ts = first.timestamp;
    let mut total = Duration::ZERO;
    for event in events {
        total += scaled_gap(
            raw_gap(prev_ts, event.timestamp),
            time_scale,
            density,
            min_gap,
        );
        prev_ts = event.timestamp;
    }
    total
}

/// Replays `events` against `target_base`, returning the run's result.
///
/// Only the path and query of each captured URL are replayed; the host is
/// substituted with `target_base`. Request failures are recorded, never
/// fatal: they count into `error_count` and appear in the signature stream
/// under their error class.
pub async fn replay_events(
    events: &[Event],
    target_base: &str,
    cfg: &ReplayConfig,
) -> Result<ReplayResult, DriverError> {
    if !(cfg.time_scale.is_finite() && cfg.time_scale > 0.0) {
        return Err(DriverError::InvalidTimeScale(cfg.time_scale));
    }
    if !(cfg.density.is_finite() && cfg.density > 0.0) {
        return Err(DriverError::InvalidDensity(cfg.density));
    }

    let events = if cfg.max_events > 0 && events.len() > cfg.max_events {
        &events[..cfg.max_events]
    } else {
        events
    };
    if events.is_empty() {
        return Err(DriverError::NoEvents);
    }

    let expected = expected_duration(events, cfg.time_scale, cfg.density, cfg.min_gap);
    let client = reqwest::Client::builder()
        .build()
        .map_err(DriverError::Client)?;

    let start = Instant::now();
    let deadline = (cfg.max_wall_clock > Duration::ZERO).then(|| start + cfg.max_wall_clock);

    let mut run = ReplayResult {
        total_events: events.len(),
        expected_duration: expected,
        response_signatures: Vec::with_capacity(events.len()),
        ..ReplayResult::default()
    };
    let mut hasher = Sha256::new();

    let mut last_progress = start;
    let mut prev_ts = events[0].timestamp;
    let mut next_at = Instant::now();

    for (i, event) in events.iter().enumerate() {
        if cfg.max_idle_time > Duration::ZERO && last_progress.elapsed() > cfg.max_idle_time {
            return Ok(finish_stalled(run, i, start));
        }

        let gap = scaled_gap(
            raw_gap(prev_ts, event.timestamp),
            cfg.time_scale,
            cfg.density,
            cfg.min_gap,
        );
        next_at += gap;
        tokio::time::sleep_until(next_at).await;

        if deadline.is_some_and(|d| Instant::now() > d) {
            run.time_expanded =
                Some("replay exceeded wall-clock limit while preserving timing".to_string());
            run.completed_events = i;
            run.run_duration = start.elapsed();
            return Ok(run);
        }
        prev_ts = event.timestamp;

        if i == 0 || i % 10 == 0 {
            debug!(
                completed = i,
                total = events.len(),
                gap_ms = gap.as_millis() as u64,
                density = cfg.density,
                "replay progress"
            );
        }

        let uri = request_uri(&event.url)?;
        let method = reqwest::Method::from_bytes(event.method.as_bytes())
            .map_err(|_| DriverError::BadMethod(event.method.clone()))?;
        let send = client
            .request(method, format!("{target_base}{uri}"))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send();

        let outcome = if cfg.max_idle_time > Duration::ZERO {
            // Race the pending response against the idle deadline, anchored
            // at issue time: scheduled inter-arrival silence is intentional
            // and never counts toward the stall window, but a target that
            // stops answering is a stall, not a stream of timeout errors.
            let idle_deadline = Instant::now() + cfg.max_idle_time;
            match tokio::time::timeout_at(idle_deadline, send).await {
                Ok(res) => res,
                Err(_) => return Ok(finish_stalled(run, i, start)),
            }
        } else {
            send.await
        };

        let signature = match outcome {
            Ok(response) => format!("{} {} {}", event.method, uri, response.status().as_u16()),
            Err(err) => {
                run.error_count += 1;
                format!("{} {} ERR:{}", event.method, uri, error_class(&err))
            }
        };
        hasher.update(signature.as_bytes());
        run.response_signatures.push(signature);
        last_progress = Instant::now();
        run.last_progress_index = i + 1;

        if deadline.is_some_and(|d| Instant::now() > d) {
            run.time_expanded =
                Some("replay exceeded wall-clock limit while awaiting responses".to_string());
            run.completed_events = i + 1;
            run.run_duration = start.elapsed();
            return Ok(run);
        }
    }

    run.fingerprint = hasher.finalize().into();
    run.completed_events = events.len();
    run.run_duration = start.elapsed();
    Ok(run)
}

fn finish_stalled(mut run: ReplayResult, index: usize, start: Instant) -> ReplayResult {
    run.stalled = Some("no replay progress observed within idle limit".to_string());
    run.completed_events = index;
    run.run_duration = start.elapsed();
    run
}

fn raw_gap(prev: chrono::DateTime<chrono::Utc>, next: chrono::DateTime<chrono::Utc>) -> Duration {
    // Timestamps are not assumed monotone; negative gaps clamp to zero.
    (next - prev).to_std().unwrap_or(Duration::ZERO)
}

fn scaled_gap(raw: Duration, time_scale: f64, density: f64, min_gap: Duration) -> Duration {
    let scaled = raw.mul_f64(time_scale / density);
    scaled.max(min_gap)
}

/// Extracts the path-and-query portion of a captured URL, tolerating both
/// absolute (`http://host/path?q=1`) and relative (`/path?q=1`) forms.
pub fn request_uri(raw: &str) -> Result<String, DriverError> {
    let bad_url = |source| DriverError::BadUrl {
        url: raw.to_string(),
        source,
    };
    let parsed = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("http://incident.invalid/")
            .and_then(|base| base.join(raw))
            .map_err(bad_url)?,
        Err(source) => return Err(bad_url(source)),
    };
    let mut uri = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        uri.push('?');
        uri.push_str(query);
    }
    Ok(uri)
}

/// Folds a transport failure into a small closed class set so identical
/// dependency failures fingerprint identically across replays.
#[must_use]
pub fn error_class(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_redirect() {
        "redirect"
    } else if err.is_request() {
        "request"
    } else if err.is_body() || err.is_decode() {
        "body"
    } else {
        "transport"
    }
}
