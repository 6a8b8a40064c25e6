//! Deterministic capture-and-replay engine for networked services.
//!
//! A live service is wrapped by two interception points: an inbound reverse
//! proxy that records every client request and an outbound forward proxy that
//! records every call the service makes to its dependencies. Together these
//! produce an incident log pair. The replay half of the crate drives the
//! recorded inbound requests against a fresh service instance while a stub
//! proxy impersonates the recorded dependencies, optionally injecting
//! latency, timeouts, or forced retries, and classifies the run against a
//! closed outcome taxonomy.
//!
//! # Module Map
//!
//! - [`event`] — the captured event model plus the newline-delimited JSON
//!   log reader/writer.
//! - [`inject`] — typed fault-injection rules keyed by dependency host.
//! - [`replay`] — the deterministic, time-scaled replay driver and its
//!   response-sequence fingerprint.
//! - [`stub`] — the sequence-matching stub dependency proxy (explicit-proxy
//!   and transparent-redirect modes).
//! - [`capture`] — the inbound reverse proxy and outbound forward proxy used
//!   during incident capture.
//! - [`orchestrator`] — runs waves of concurrent drivers against a shared
//!   stub and aggregates their results.
//! - [`outcome`] — the outcome classifier and the replay summary surface.
//! - [`snapshot`] — the advisory last-run snapshot used for delta reporting.

pub mod capture;
pub mod event;
pub mod http1;
pub mod inject;
pub mod orchestrator;
pub mod outcome;
pub mod replay;
pub mod snapshot;
pub mod stub;
