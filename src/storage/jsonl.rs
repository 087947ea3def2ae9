//! Newline-delimited textual encoder.
//!
//! One JSON object per line, named fields, terminated by `0x0A`. Slower and
//! larger than the framed encoder but greppable, which is the point. Unknown
//! fields on read are ignored so the format can grow.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::storage::{
    load_session_metadata, save_session_metadata, Event, EventFilter, EventStore, Scan, Session,
    StoreError,
};

/// File name of the textual event data within a session directory.
pub const JSONL_FILE_NAME: &str = "events.jsonl";

pub struct JsonlStore {
    session_dir: PathBuf,
    events_path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    session: Mutex<Session>,
    event_count: AtomicU64,
}

impl JsonlStore {
    pub fn create(session_dir: &Path, session: &Session) -> Result<JsonlStore, StoreError> {
        let events_path = session_dir.join(JSONL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)?;

        Ok(JsonlStore {
            session_dir: session_dir.to_path_buf(),
            events_path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            session: Mutex::new(session.clone()),
            event_count: AtomicU64::new(0),
        })
    }

    /// Open an existing session, recovering the count by a line scan. A
    /// malformed tail line is tolerated; scans surface it as a diagnostic.
    pub fn open(session_dir: &Path) -> Result<JsonlStore, StoreError> {
        let session = load_session_metadata(session_dir)?;
        let events_path = session_dir.join(JSONL_FILE_NAME);
        let (count, damage) = count_lines(&events_path)?;
        if let Some(err) = damage {
            tracing::warn!(session = %session.id, %err, "event data has a damaged tail");
        }

        let file = OpenOptions::new().append(true).open(&events_path)?;

        Ok(JsonlStore {
            session_dir: session_dir.to_path_buf(),
            events_path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            session: Mutex::new(session),
            event_count: AtomicU64::new(count),
        })
    }

    fn write_line(writer: &mut BufWriter<File>, event: &Event) -> Result<(), StoreError> {
        let line = serde_json::to_vec(event)
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("marshal event: {e}"))))?;
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

impl EventStore for JsonlStore {
    fn append_one(&self, event: &Event) -> Result<(), StoreError> {
        let mut guard = self.writer.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| StoreError::Io(std::io::Error::other("store is closed")))?;
        Self::write_line(writer, event)?;
        writer.flush()?;
        drop(guard);

        self.event_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn append_batch(&self, events: &[Event]) -> Result<(), StoreError> {
        let mut guard = self.writer.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| StoreError::Io(std::io::Error::other("store is closed")))?;
        for event in events {
            Self::write_line(writer, event)?;
        }
        writer.flush()?;
        drop(guard);

        self.event_count.fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn scan(&self, filter: &EventFilter) -> Result<Scan, StoreError> {
        let mut lines = LineScanner::open(&self.events_path)?;
        let mut scan = Scan::default();
        let mut skipped = 0usize;

        loop {
            let event = match lines.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    scan.diagnostic = Some(err);
                    break;
                }
            };
            if !filter.matches(&event) {
                continue;
            }
            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            scan.events.push(event);
            if filter.limit > 0 && scan.events.len() >= filter.limit {
                break;
            }
        }

        Ok(scan)
    }

    fn unique_goroutines(&self) -> Result<BTreeSet<u32>, StoreError> {
        let mut lines = LineScanner::open(&self.events_path)?;
        let mut goroutines = BTreeSet::new();
        loop {
            match lines.next_event() {
                Ok(Some(event)) => {
                    goroutines.insert(event.goroutine);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "stopping goroutine walk at damaged tail");
                    break;
                }
            }
        }
        Ok(goroutines)
    }

    fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    fn session(&self) -> Session {
        let mut session = self.session.lock().unwrap().clone();
        session.event_count = self.event_count();
        session
    }

    fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut guard = self.session.lock().unwrap();
        *guard = session.clone();
        save_session_metadata(&self.session_dir, session)
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.writer.lock().unwrap();
        if let Some(writer) = guard.take() {
            let file = writer
                .into_inner()
                .map_err(|e| StoreError::Io(e.into_error()))?;
            file.sync_all()?;
        }
        Ok(())
    }
}

struct LineScanner {
    reader: BufReader<File>,
    offset: u64,
    line: String,
}

impl LineScanner {
    fn open(path: &Path) -> Result<LineScanner, StoreError> {
        let file = File::open(path)?;
        Ok(LineScanner {
            reader: BufReader::new(file),
            offset: 0,
            line: String::new(),
        })
    }

    fn next_event(&mut self) -> Result<Option<Event>, StoreError> {
        loop {
            let line_start = self.offset;
            self.line.clear();
            let n = self.reader.read_line(&mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            self.offset += n as u64;

            let trimmed = self.line.trim_end_matches('\n');
            if trimmed.is_empty() {
                continue;
            }
            let event = serde_json::from_str(trimmed).map_err(|e| StoreError::Parse {
                offset: line_start,
                reason: format!("unmarshal event: {e}"),
            })?;
            return Ok(Some(event));
        }
    }
}

/// Count well-formed event lines, stopping at the first damaged one.
fn count_lines(path: &Path) -> Result<(u64, Option<StoreError>), StoreError> {
    let mut lines = match LineScanner::open(path) {
        Ok(lines) => lines,
        Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((0, None))
        }
        Err(e) => return Err(e),
    };

    let mut count = 0u64;
    loop {
        match lines.next_event() {
            Ok(Some(_)) => count += 1,
            Ok(None) => return Ok((count, None)),
            Err(err) => return Ok((count, Some(err))),
        }
    }
}
