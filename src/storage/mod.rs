//! Session storage: the stored event model, the store contract, and the two
//! on-disk encoders.
//!
//! A session is a directory named by the session id, holding `metadata.json`
//! and exactly one event-data file. The encoder in use is inferred from the
//! event-data file name: `events.pb` for the length-prefixed framed encoder,
//! `events.jsonl` for the newline-delimited textual one. Both encoders
//! round-trip events exactly and share the [`EventStore`] contract.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{EventKind, RuntimeEvent, ATTRIBUTE_SLOTS};

pub mod framed;
pub mod jsonl;
pub mod manager;

pub use framed::FramedStore;
pub use jsonl::JsonlStore;
pub use manager::{SessionManager, StorageFormat};

/// A runtime event in its stored form.
///
/// This is the wire record minus the probe-duration field, which exists only
/// for overhead accounting and never reaches disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: u64,
    pub event_type: EventKind,
    pub goroutine: u32,
    pub parent_goroutine: u32,
    pub attributes: [u64; ATTRIBUTE_SLOTS],
}

impl From<RuntimeEvent> for Event {
    fn from(ev: RuntimeEvent) -> Event {
        Event {
            timestamp: ev.timestamp,
            event_type: ev.kind,
            goroutine: ev.goroutine,
            parent_goroutine: ev.parent_goroutine,
            attributes: ev.attributes,
        }
    }
}

/// Metadata for one monitoring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "pid_is_unset")]
    pub pid: i32,
    pub binary_path: String,
    #[serde(default)]
    pub event_count: u64,
}

fn pid_is_unset(pid: &i32) -> bool {
    *pid == 0
}

impl Session {
    /// A fresh session with a random id, started now.
    pub fn new(pid: i32, binary_path: impl Into<String>) -> Session {
        Session {
            id: uuid::Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            end_time: None,
            pid,
            binary_path: binary_path.into(),
            event_count: 0,
        }
    }
}

/// Filters applied to a scan, combined with logical AND.
///
/// `offset` skips that many matching events; `limit` caps the result
/// (0 means unlimited).
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub goroutine: Option<u32>,
    pub event_type: Option<EventKind>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

impl EventFilter {
    /// Field-level match; offset and limit are applied by the scan loop.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(gid) = self.goroutine {
            if event.goroutine != gid {
                return false;
            }
        }
        if let Some(kind) = self.event_type {
            if event.event_type != kind {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if event.timestamp > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("truncated or malformed record at byte {offset}: {reason}")]
    Parse { offset: u64, reason: String },
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("unknown storage format: {0} (supported: jsonl, protobuf)")]
    InvalidFormat(String),
    #[error("session {0} has a live writer")]
    InUse(String),
}

/// Result of a scan.
///
/// When the stream ends in a truncated or malformed tail record, the events
/// decoded before the damage are returned and `diagnostic` carries the parse
/// error with the byte offset where decoding stopped. The caller decides
/// whether to surface it.
#[derive(Debug, Default)]
pub struct Scan {
    pub events: Vec<Event>,
    pub diagnostic: Option<StoreError>,
}

/// Contract shared by every session-store encoder.
///
/// A store has at most one writer; readers open their own file handle and
/// observe data up to the last flush. Append methods take `&self` and
/// serialize internally behind the store's write lock.
pub trait EventStore: Send + Sync {
    /// Append one event to the write buffer.
    fn append_one(&self, event: &Event) -> Result<(), StoreError>;

    /// Append a batch and flush it to the file before returning. Either all
    /// records are appended and counted or none are.
    fn append_batch(&self, events: &[Event]) -> Result<(), StoreError>;

    /// Scan events in append order, applying `filter`.
    fn scan(&self, filter: &EventFilter) -> Result<Scan, StoreError>;

    /// Unique goroutine ids observed in the store, one pass.
    fn unique_goroutines(&self) -> Result<BTreeSet<u32>, StoreError>;

    /// Events appended (or recovered on open); monotone.
    fn event_count(&self) -> u64;

    /// Session metadata, with the live event count folded in.
    fn session(&self) -> Session;

    /// Replace session metadata and persist it.
    fn update_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Flush, fsync, and close the data file.
    fn close(&self) -> Result<(), StoreError>;
}

pub(crate) fn save_session_metadata(session_dir: &Path, session: &Session) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(session)
        .map_err(|e| StoreError::Io(io::Error::other(format!("marshal session metadata: {e}"))))?;
    fs::write(session_dir.join("metadata.json"), data)?;
    Ok(())
}

pub(crate) fn load_session_metadata(session_dir: &Path) -> Result<Session, StoreError> {
    let data = fs::read(session_dir.join("metadata.json"))?;
    serde_json::from_slice(&data).map_err(|e| StoreError::Parse {
        offset: 0,
        reason: format!("unmarshal session metadata: {e}"),
    })
}
