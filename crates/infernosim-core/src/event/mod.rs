//! Captured execution events.
//!
//! An [`Event`] is one record of the incident log: an inbound request seen by
//! the reverse proxy, an outbound call seen by the forward proxy, or a
//! response variant. Events are immutable once captured; the replay engine
//! only reads them. Within a log file, position order is authoritative —
//! timestamps are not assumed monotone and consumers must clamp negative
//! gaps.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod log;

pub use log::{load_events, load_inbound, load_outbound, EventLogError, EventLogWriter};

/// The event type tag carried on the wire.
///
/// The capture format also contains gRPC and response variants; the replay
/// engine consumes only [`EventKind::InboundRequest`] and
/// [`EventKind::OutboundCall`] and skips everything else. Unrecognized tags
/// deserialize as [`EventKind::Other`] rather than failing the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// A client request observed by the inbound reverse proxy.
    InboundRequest,
    /// The response returned to a client, observed by the inbound proxy.
    InboundResponse,
    /// A dependency call observed by the outbound forward proxy.
    OutboundCall,
    /// Any type tag this engine does not consume (response/gRPC variants).
    Other,
}

impl EventKind {
    /// Wire spelling of this tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InboundRequest => "InboundRequest",
            Self::InboundResponse => "InboundResponse",
            Self::OutboundCall => "OutboundCall",
            Self::Other => "Other",
        }
    }
}

impl From<String> for EventKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "InboundRequest" => Self::InboundRequest,
            "InboundResponse" => Self::InboundResponse,
            "OutboundCall" => Self::OutboundCall,
            _ => Self::Other,
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A single captured execution event.
///
/// Optional fields serialize with Go-style `omitempty` semantics: absent
/// values are omitted from the JSON record rather than written as nulls, so
/// logs written here round-trip against logs written by the original capture
/// agents. Unknown fields in incoming records are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Stable identifier for this record.
    pub id: String,

    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Capture time, UTC with sub-second precision.
    pub timestamp: DateTime<Utc>,

    /// The service (host:port) this event was observed against.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,

    /// HTTP method, when applicable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// Request URL. Absolute for outbound calls; inbound URLs may be
    /// relative or absolute depending on how the client addressed the proxy.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Response status. `0` means the call errored before a status was
    /// observed ("captured error").
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub status: u16,

    /// Call duration in nanoseconds.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub duration: u64,

    /// Error string for captured failures.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Request headers, name to ordered value sequence.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Vec<String>>,

    /// Request body size in bytes, when known.
    #[serde(rename = "bodySize", default, skip_serializing_if = "is_zero_i64")]
    pub body_size: i64,

    /// Correlation identifier propagated through the service under capture.
    #[serde(rename = "traceId", default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
}

impl Event {
    /// Creates a new event of the given kind, stamped now, with a fresh ID.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: generate_id(),
            kind,
            timestamp: Utc::now(),
            service: String::new(),
            method: String::new(),
            url: String::new(),
            status: 0,
            duration: 0,
            error: String::new(),
            headers: HashMap::new(),
            body_size: 0,
            trace_id: String::new(),
        }
    }
}

/// Returns a random 32-character hex identifier.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}
