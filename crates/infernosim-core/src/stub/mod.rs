//! Sequence-matching stub dependency proxy.
//!
//! During replay the service under test is pointed at this stub instead of
//! its real dependencies. The stub serves the captured outbound sequence
//! back: each arrival is matched against the next expected event, divergence
//! (unexpected extra calls, method or URL mismatches) is recorded without
//! killing the wire, and per-dependency injection rules add latency, force
//! 504 timeouts, or fail the first N attempts to push the service into its
//! retry path.
//!
//! Two listener modes share one state machine and one sequence counter:
//!
//! - **explicit** — a proxy-aware client sends absolute-form requests; the
//!   stub answers each over a kept-alive connection.
//! - **transparent** — an OS-level TCP redirect delivers raw connections;
//!   the original destination is recovered from the socket, one HTTP/1.1
//!   request is read, and a minimal response is written. The request is
//!   never forwarded upstream; the response is synthesized from the capture.
//!
//! Monotone counters are atomics; the divergence-reason list, the sticky
//! unexpected-outbound bit, and the per-dependency attempts map share one
//! mutex. Injected sleeps hold no locks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use url::Url;

use crate::event::{self, Event, EventKind, EventLogError, EventLogWriter};
use crate::http1;
use crate::inject::{host_key, match_rule, InjectionRule};

mod original_dst;

pub use original_dst::original_dst;

/// Stub proxy state shared by every listener mode.
pub struct StubProxy {
    /// Expected outbound sequence, immutable after construction.
    events: Vec<Event>,
    rules: Vec<InjectionRule>,

    next_index: AtomicU64,
    observed: AtomicU64,
    max_observed: AtomicU64,
    cycle_expected: AtomicBool,
    forward_errors: AtomicU64,
    forward_success: AtomicU64,

    guarded: Mutex<GuardedState>,

    observed_log: Option<EventLogWriter>,
}

#[derive(Default)]
struct GuardedState {
    attempts: HashMap<String, u32>,
    divergence_reasons: Vec<String>,
    unexpected_outbound: bool,
}

impl StubProxy {
    /// Builds a stub serving the given expected outbound sequence.
    #[must_use]
    pub fn new(events: Vec<Event>, rules: Vec<InjectionRule>) -> Self {
        Self {
            events,
            rules,
            next_index: AtomicU64::new(0),
            observed: AtomicU64::new(0),
            max_observed: AtomicU64::new(0),
            cycle_expected: AtomicBool::new(false),
            forward_errors: AtomicU64::new(0),
            forward_success: AtomicU64::new(0),
            guarded: Mutex::new(GuardedState::default()),
            observed_log: None,
        }
    }

    /// Loads the expected sequence from a captured outbound log.
    ///
    /// When `observed_log` is given, every arrival is appended there as an
    /// `OutboundCall` event. Replay passes `None`: observed replay traffic
    /// must not contaminate the captured incident.
    pub fn from_log(
        outbound_log: &Path,
        observed_log: Option<&Path>,
        rules: Vec<InjectionRule>,
    ) -> Result<Self, EventLogError> {
        let events = event::load_outbound(outbound_log)?;
        let mut stub = Self::new(events, rules);
        if let Some(path) = observed_log {
            stub.observed_log = Some(EventLogWriter::open(path)?);
        }
        Ok(stub)
    }

    /// Zeroes all per-run state so the same captured sequence replays
    /// deterministically across runs.
    pub fn reset(&self) {
        self.next_index.store(0, Ordering::SeqCst);
        self.observed.store(0, Ordering::SeqCst);
        self.max_observed.store(0, Ordering::SeqCst);
        let mut guarded = self.lock_guarded();
        guarded.attempts.clear();
        guarded.divergence_reasons.clear();
        guarded.unexpected_outbound = false;
    }

    /// Sets whether the expected vector wraps modulo its length (used when
    /// several drivers interleave against one stub) and how many arrivals
    /// the run may serve before they count as unexpected. `max_observed`
    /// of zero disables the cap.
    pub fn configure_replay_cardinality(&self, cycle_expected: bool, max_observed: u64) {
        self.cycle_expected.store(cycle_expected, Ordering::SeqCst);
        self.max_observed.store(max_observed, Ordering::SeqCst);
    }

    /// Applies the matching state machine to one arrival and returns the
    /// status to answer with.
    ///
    /// `observed_url` is the request target as sent; `host` identifies the
    /// dependency (authority from an absolute-form target, else the `Host`
    /// header, else the recovered original destination).
    pub async fn serve_one(&self, method: &str, observed_url: &str, host: &str) -> u16 {
        let idx = self.next_index.load(Ordering::SeqCst);
        let seen = self.observed.fetch_add(1, Ordering::SeqCst) + 1;
        self.record_observed(method, host, format!("http://{host}"));
        debug!(method, host, index = idx, seen, "stub arrival");

        let max_observed = self.max_observed.load(Ordering::SeqCst);
        if max_observed > 0 && seen > max_observed {
            self.record_unexpected(idx);
            return 502;
        }
        if self.events.is_empty() {
            return 502;
        }
        let cycle = self.cycle_expected.load(Ordering::SeqCst);
        if !cycle && idx as usize >= self.events.len() {
            self.record_unexpected(idx);
            return 502;
        }
        let expected = &self.events[idx as usize % self.events.len()];

        if !expected.method.is_empty() && expected.method != method {
            self.record_divergence(idx, "method_mismatch", expected, method, observed_url, host);
        }
        if !expected.url.is_empty() && !observed_url.contains(expected_host(&expected.url)) {
            self.record_divergence(idx, "url_mismatch", expected, method, observed_url, host);
        }

        self.next_index.fetch_add(1, Ordering::SeqCst);

        let dep = host_key(host);
        let attempts = {
            let mut guarded = self.lock_guarded();
            let count = guarded.attempts.entry(dep.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(rule) = match_rule(dep, &self.rules) {
            if rule.timeout > Duration::ZERO {
                tokio::time::sleep(rule.timeout).await;
                return 504;
            }
            if rule.add_latency > Duration::ZERO {
                tokio::time::sleep(rule.add_latency).await;
            }
            if let Some(limit) = rule.retry_limit {
                if attempts <= limit {
                    return 502;
                }
            }
        }

        if expected.status == 0 {
            // Captured error: the original call never produced a status.
            return 502;
        }
        expected.status
    }

    /// Accept loop for explicit-proxy mode. Each connection is served on its
    /// own task; connections are kept alive across requests.
    pub async fn serve_explicit(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "stub connection (explicit)");
            let stub = Arc::clone(self);
            tokio::spawn(async move { stub.handle_explicit(stream).await });
        }
    }

    /// Accept loop for transparent-redirect mode. One exchange per
    /// connection; the original destination is recovered from the socket.
    pub async fn serve_transparent(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "stub connection (transparent)");
            let stub = Arc::clone(self);
            tokio::spawn(async move { stub.handle_transparent(stream).await });
        }
    }

    async fn handle_explicit(&self, stream: TcpStream) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        loop {
            let head = match http1::read_request_head(&mut reader).await {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(err) => {
                    debug!(error = %err, "stub dropped unparseable explicit request");
                    return;
                }
            };
            match head.content_length() {
                Ok(0) => {}
                Ok(len) => {
                    if http1::read_body(&mut reader, len).await.is_err() {
                        return;
                    }
                }
                Err(_) => {
                    let _ = http1::write_empty_response(&mut write, 411).await;
                    return;
                }
            }
            let host = explicit_request_host(&head);
            let status = self.serve_one(&head.method, &head.target, &host).await;
            if let Err(err) = http1::write_empty_response(&mut write, status).await {
                self.count_write_failure(&err);
                return;
            }
            self.forward_success.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn handle_transparent(&self, stream: TcpStream) {
        let destination = original_dst(&stream).ok();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let head = match http1::read_request_head(&mut reader).await {
            Ok(Some(head)) => head,
            _ => {
                let url = destination
                    .map(|addr| format!("tcp://{addr}"))
                    .unwrap_or_default();
                self.record_observed("UNKNOWN", "", url);
                return;
            }
        };
        if let Ok(len @ 1..) = head.content_length() {
            if http1::read_body(&mut reader, len).await.is_err() {
                return;
            }
        }

        let mut host = head.header("host").unwrap_or_default().to_string();
        if host.is_empty() {
            host = destination.map(|addr| addr.to_string()).unwrap_or_default();
        }
        let status = self.serve_one(&head.method, &head.target, &host).await;
        if let Err(err) = http1::write_empty_response(&mut write, status).await {
            self.count_write_failure(&err);
            return;
        }
        self.forward_success.fetch_add(1, Ordering::SeqCst);
    }

    /// Peer hang-ups are not forwarding failures; anything else is.
    fn count_write_failure(&self, err: &std::io::Error) {
        use std::io::ErrorKind;
        if matches!(
            err.kind(),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
        ) {
            debug!(error = %err, "stub peer hung up before response");
            return;
        }
        warn!(error = %err, "stub response delivery failed");
        self.forward_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn record_unexpected(&self, idx: u64) {
        let reason = format!("DIVERGENCE at outbound event index={idx} why=unexpected_outbound_call");
        warn!("{reason}");
        let mut guarded = self.lock_guarded();
        guarded.divergence_reasons.push(reason);
        guarded.unexpected_outbound = true;
    }

    fn record_divergence(
        &self,
        idx: u64,
        why: &str,
        expected: &Event,
        method: &str,
        observed_url: &str,
        host: &str,
    ) {
        let reason = format!(
            "DIVERGENCE at outbound event index={idx} why={why} \
             expected={{method={} url={}}} got={{method={method} url={observed_url} host={host}}}",
            expected.method, expected.url,
        );
        warn!("{reason}");
        self.lock_guarded().divergence_reasons.push(reason);
    }

    fn record_observed(&self, method: &str, host: &str, url: String) {
        let Some(log) = &self.observed_log else {
            return;
        };
        let mut e = Event::new(EventKind::OutboundCall);
        e.method = method.to_string();
        e.service = host.to_string();
        e.url = url;
        if let Err(err) = log.append(&e) {
            warn!(error = %err, "stub observation log append failed");
        }
    }

    fn lock_guarded(&self) -> std::sync::MutexGuard<'_, GuardedState> {
        self.guarded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Total arrivals this run, including rejected ones.
    #[must_use]
    pub fn observed_count(&self) -> u64 {
        self.observed.load(Ordering::SeqCst)
    }

    /// Responses the stub failed to deliver.
    #[must_use]
    pub fn forward_errors(&self) -> u64 {
        self.forward_errors.load(Ordering::SeqCst)
    }

    /// Responses delivered.
    #[must_use]
    pub fn forward_success(&self) -> u64 {
        self.forward_success.load(Ordering::SeqCst)
    }

    /// Length of the expected outbound sequence.
    #[must_use]
    pub fn expected_count(&self) -> usize {
        self.events.len()
    }

    /// Snapshot of recorded divergence reasons, in arrival order.
    #[must_use]
    pub fn divergence_reasons(&self) -> Vec<String> {
        self.lock_guarded().divergence_reasons.clone()
    }

    /// True once any arrival exceeded the run's cardinality. Sticky until
    /// [`StubProxy::reset`].
    #[must_use]
    pub fn unexpected_outbound(&self) -> bool {
        self.lock_guarded().unexpected_outbound
    }
}

/// Dependency authority of an explicit-mode request: absolute-form target
/// authority first, then the `Host` header.
fn explicit_request_host(head: &http1::RequestHead) -> String {
    if let Ok(url) = Url::parse(&head.target) {
        if let Some(host) = url.host_str() {
            return match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
        }
    }
    if head.method == "CONNECT" {
        // Authority-form target.
        return head.target.clone();
    }
    head.header("host").unwrap_or_default().to_string()
}

/// Host portion of a captured URL, for substring matching against observed
/// targets.
fn expected_host(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix("http://").or_else(|| raw.strip_prefix("https://")) {
        let end = rest.find(['/', '?']).unwrap_or(rest.len());
        return &rest[..end];
    }
    raw
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::inject::parse_rules;

    fn outbound(method: &str, url: &str, status: u16) -> Event {
        let mut e = Event::new(EventKind::OutboundCall);
        e.timestamp = Utc::now();
        e.method = method.to_string();
        e.url = url.to_string();
        e.status = status;
        e
    }

    fn stub_with(events: Vec<Event>, rules: &[&str]) -> StubProxy {
        let raw: Vec<String> = rules.iter().map(ToString::to_string).collect();
        StubProxy::new(events, parse_rules(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_serves_captured_statuses_in_sequence() {
        let stub = stub_with(
            vec![
                outbound("GET", "http://worldtimeapi.org/api/tz", 200),
                outbound("GET", "http://worldtimeapi.org/api/tz", 404),
            ],
            &[],
        );
        assert_eq!(stub.serve_one("GET", "http://worldtimeapi.org/api/tz", "worldtimeapi.org").await, 200);
        assert_eq!(stub.serve_one("GET", "http://worldtimeapi.org/api/tz", "worldtimeapi.org").await, 404);
        assert_eq!(stub.observed_count(), 2);
        assert!(stub.divergence_reasons().is_empty());
        assert!(!stub.unexpected_outbound());
    }

    #[tokio::test]
    async fn test_exhausted_sequence_is_unexpected_and_sticky() {
        let stub = stub_with(vec![outbound("GET", "http://api.example/a", 200)], &[]);
        assert_eq!(stub.serve_one("GET", "http://api.example/a", "api.example").await, 200);
        assert_eq!(stub.serve_one("GET", "http://api.example/a", "api.example").await, 502);
        assert!(stub.unexpected_outbound());
        assert_eq!(stub.observed_count(), 2);
        let reasons = stub.divergence_reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("unexpected_outbound_call"));
    }

    #[tokio::test]
    async fn test_cycling_wraps_the_expected_vector() {
        let stub = stub_with(
            vec![
                outbound("GET", "http://api.example/a", 200),
                outbound("GET", "http://api.example/b", 201),
            ],
            &[],
        );
        stub.configure_replay_cardinality(true, 0);
        for expected in [200, 201, 200, 201] {
            assert_eq!(
                stub.serve_one("GET", "http://api.example/any", "api.example").await,
                expected
            );
        }
        assert!(!stub.unexpected_outbound());
    }

    #[tokio::test]
    async fn test_max_observed_cap_rejects_excess_arrivals() {
        let stub = stub_with(vec![outbound("GET", "http://api.example/a", 200)], &[]);
        stub.configure_replay_cardinality(true, 2);
        assert_eq!(stub.serve_one("GET", "/a", "api.example").await, 200);
        assert_eq!(stub.serve_one("GET", "/a", "api.example").await, 200);
        assert_eq!(stub.serve_one("GET", "/a", "api.example").await, 502);
        assert!(stub.unexpected_outbound());
        assert_eq!(stub.observed_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_expected_vector_rejects_all() {
        let stub = stub_with(vec![], &[]);
        assert_eq!(stub.serve_one("GET", "/a", "api.example").await, 502);
        assert_eq!(stub.observed_count(), 1);
    }

    #[tokio::test]
    async fn test_method_mismatch_is_recorded_but_served() {
        let stub = stub_with(vec![outbound("GET", "http://api.example/a", 200)], &[]);
        assert_eq!(stub.serve_one("POST", "http://api.example/a", "api.example").await, 200);
        let reasons = stub.divergence_reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("method_mismatch"));
        assert!(!stub.unexpected_outbound());
    }

    #[tokio::test]
    async fn test_url_mismatch_compares_expected_host_substring() {
        let stub = stub_with(
            vec![
                outbound("GET", "http://worldtimeapi.org/api/tz", 200),
                outbound("GET", "http://worldtimeapi.org/api/tz", 200),
            ],
            &[],
        );
        assert_eq!(
            stub.serve_one("GET", "http://worldtimeapi.org/other", "worldtimeapi.org").await,
            200
        );
        assert!(stub.divergence_reasons().is_empty());

        assert_eq!(stub.serve_one("GET", "http://redis:6379/ping", "redis:6379").await, 200);
        let reasons = stub.divergence_reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("url_mismatch"));
    }

    #[tokio::test]
    async fn test_captured_error_replays_as_bad_gateway() {
        let stub = stub_with(vec![outbound("GET", "http://api.example/a", 0)], &[]);
        assert_eq!(stub.serve_one("GET", "/a", "api.example").await, 502);
    }

    #[tokio::test]
    async fn test_timeout_injection_answers_gateway_timeout() {
        let stub = stub_with(
            vec![outbound("GET", "http://worldtimeapi.org/api/tz", 200)],
            &["dep=worldtimeapi.org timeout=5ms"],
        );
        assert_eq!(
            stub.serve_one("GET", "/api/tz", "worldtimeapi.org:80").await,
            504
        );
    }

    #[tokio::test]
    async fn test_retry_injection_fails_first_attempts_per_dependency() {
        let stub = stub_with(
            vec![
                outbound("GET", "http://api.example/a", 200),
                outbound("GET", "http://api.example/a", 200),
                outbound("GET", "http://api.example/a", 200),
            ],
            &["dep=api.example retries=2"],
        );
        assert_eq!(stub.serve_one("GET", "/a", "api.example").await, 502);
        assert_eq!(stub.serve_one("GET", "/a", "api.example").await, 502);
        assert_eq!(stub.serve_one("GET", "/a", "api.example").await, 200);
    }

    #[tokio::test]
    async fn test_reset_replays_identically() {
        let events = vec![
            outbound("GET", "http://api.example/a", 200),
            outbound("GET", "http://api.example/b", 503),
        ];
        let stub = stub_with(events, &["dep=api.example retries=1"]);

        let mut first = Vec::new();
        for _ in 0..3 {
            first.push(stub.serve_one("GET", "/x", "api.example").await);
        }
        stub.reset();
        let mut second = Vec::new();
        for _ in 0..3 {
            second.push(stub.serve_one("GET", "/x", "api.example").await);
        }
        assert_eq!(first, second);
        assert_eq!(stub.observed_count(), 3);
        assert!(!stub.unexpected_outbound());
    }

    #[test]
    fn test_expected_host_extraction() {
        assert_eq!(expected_host("http://worldtimeapi.org/api/tz"), "worldtimeapi.org");
        assert_eq!(expected_host("https://api.example:8443/x?q=1"), "api.example:8443");
        assert_eq!(expected_host("redis:6379"), "redis:6379");
    }
}
