//! Newline-delimited JSON event log reader and writer.
//!
//! One JSON object per line. The reader yields a filtered, ordered event
//! vector for a requested type; the writer appends records and flushes after
//! every write so the log stays valid JSONL even if the process crashes
//! mid-capture.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Event, EventKind};

/// Errors from reading or writing an event log.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// The log file could not be opened.
    #[error("failed to open event log {path}: {source}")]
    Open {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An I/O failure while reading or writing records.
    #[error("event log i/o failure on {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record failed to parse. Carries the record index (zero-based line
    /// number among non-blank lines) and the byte offset of the record start.
    #[error("malformed event record {record} (byte offset {offset}) in {path}: {source}")]
    Malformed {
        /// Path of the offending log.
        path: PathBuf,
        /// Zero-based record index.
        record: usize,
        /// Byte offset of the start of the record.
        offset: u64,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Loads all `InboundRequest` events from the log at `path`, in file order.
pub fn load_inbound(path: &Path) -> Result<Vec<Event>, EventLogError> {
    load_events(path, EventKind::InboundRequest)
}

/// Loads all `OutboundCall` events from the log at `path`, in file order.
pub fn load_outbound(path: &Path) -> Result<Vec<Event>, EventLogError> {
    load_events(path, EventKind::OutboundCall)
}

/// Reads the log at `path` and keeps events whose type matches `kind`.
///
/// An empty file yields an empty vector, not an error. A trailing newline is
/// optional, and blank lines are skipped. The first malformed record aborts
/// the load with its index and byte offset.
pub fn load_events(path: &Path, kind: EventKind) -> Result<Vec<Event>, EventLogError> {
    let file = File::open(path).map_err(|source| EventLogError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut events = Vec::new();
    let mut offset: u64 = 0;
    let mut record = 0usize;
    for line in BufReader::new(file).split(b'\n') {
        let line = line.map_err(|source| EventLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let start = offset;
        offset += line.len() as u64 + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let event: Event =
            serde_json::from_slice(&line).map_err(|source| EventLogError::Malformed {
                path: path.to_path_buf(),
                record,
                offset: start,
                source,
            })?;
        record += 1;
        if event.kind == kind {
            events.push(event);
        }
    }
    Ok(events)
}

/// Append-only JSONL event writer shared across capture handlers.
///
/// Flushes after every record. Serialization order across concurrent writers
/// follows lock acquisition order, which is all the capture format requires:
/// within a log, file position is the authoritative ordering.
#[derive(Debug)]
pub struct EventLogWriter {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl EventLogWriter {
    /// Opens `path` for appending, creating it if absent.
    pub fn open(path: &Path) -> Result<Self, EventLogError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| EventLogError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Appends one event as a single JSON line and flushes.
    pub fn append(&self, event: &Event) -> Result<(), EventLogError> {
        let mut line = serde_json::to_vec(event).map_err(|source| EventLogError::Malformed {
            path: self.path.clone(),
            record: 0,
            offset: 0,
            source,
        })?;
        line.push(b'\n');
        let mut out = self.out.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        out.write_all(&line)
            .and_then(|()| out.flush())
            .map_err(|source| EventLogError::Io {
                path: self.path.clone(),
                source,
            })
    }
}
