//! Length-prefixed framed encoder.
//!
//! The event-data file is a stream of frames. A frame is either:
//!
//! - a single record: 4-byte little-endian payload length, then the payload;
//! - a batch: the 4-byte sentinel `0xFFFFFFFF`, a 4-byte little-endian payload
//!   length, then a payload containing a record array.
//!
//! Payloads are protobuf-encoded, so records stay self-describing and the
//! framing stays cheap. Readers dispatch on the leading u32 and accept any
//! interleaving of the two frame shapes. The sentinel is unambiguous because a
//! single-record payload can never approach 4 GiB.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use prost::Message;

use crate::event::{EventKind, ATTRIBUTE_SLOTS};
use crate::storage::{
    load_session_metadata, save_session_metadata, Event, EventFilter, EventStore, Scan, Session,
    StoreError,
};

/// File name of the framed event data within a session directory.
pub const FRAMED_FILE_NAME: &str = "events.pb";

/// Marker distinguishing a batch frame from a single-record length.
const BATCH_SENTINEL: u32 = 0xFFFF_FFFF;

/// Write-buffer size; batches amortize the flush across many records.
const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Upper bound on a sane frame payload. Anything larger is corruption: single
/// records are tens of bytes and batch payloads are bounded by the flush size.
const MAX_FRAME_BYTES: u32 = 1 << 24;

/// Self-describing payload of a single-record frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventRecord {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(uint64, tag = "2")]
    pub event_type: u64,
    #[prost(uint32, tag = "3")]
    pub goroutine: u32,
    #[prost(uint32, tag = "4")]
    pub parent_goroutine: u32,
    #[prost(uint64, repeated, tag = "5")]
    pub attributes: Vec<u64>,
}

/// Payload of a batch frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventBatch {
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<EventRecord>,
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> EventRecord {
        EventRecord {
            timestamp: event.timestamp,
            event_type: event.event_type as u64,
            goroutine: event.goroutine,
            parent_goroutine: event.parent_goroutine,
            attributes: event.attributes.to_vec(),
        }
    }
}

fn record_to_event(record: &EventRecord, offset: u64) -> Result<Event, StoreError> {
    let event_type = EventKind::try_from(record.event_type).map_err(|reason| StoreError::Parse {
        offset,
        reason,
    })?;
    let mut attributes = [0u64; ATTRIBUTE_SLOTS];
    for (slot, value) in attributes.iter_mut().zip(record.attributes.iter()) {
        *slot = *value;
    }
    Ok(Event {
        timestamp: record.timestamp,
        event_type,
        goroutine: record.goroutine,
        parent_goroutine: record.parent_goroutine,
        attributes,
    })
}

pub struct FramedStore {
    session_dir: PathBuf,
    events_path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    session: Mutex<Session>,
    event_count: AtomicU64,
}

impl FramedStore {
    /// Create the event-data file for a fresh session.
    pub fn create(session_dir: &Path, session: &Session) -> Result<FramedStore, StoreError> {
        let events_path = session_dir.join(FRAMED_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)?;

        Ok(FramedStore {
            session_dir: session_dir.to_path_buf(),
            events_path,
            writer: Mutex::new(Some(BufWriter::with_capacity(WRITE_BUFFER_BYTES, file))),
            session: Mutex::new(session.clone()),
            event_count: AtomicU64::new(0),
        })
    }

    /// Open an existing session. The event count is recovered by a frame scan;
    /// the count in `metadata.json` is only a hint. A truncated tail does not
    /// prevent opening: the well-formed prefix stays readable and scans
    /// surface the damage as a diagnostic.
    pub fn open(session_dir: &Path) -> Result<FramedStore, StoreError> {
        let session = load_session_metadata(session_dir)?;
        let events_path = session_dir.join(FRAMED_FILE_NAME);
        let (count, damage) = count_events(&events_path)?;
        if let Some(err) = damage {
            tracing::warn!(session = %session.id, %err, "event data has a damaged tail");
        }

        let file = OpenOptions::new().append(true).open(&events_path)?;

        Ok(FramedStore {
            session_dir: session_dir.to_path_buf(),
            events_path,
            writer: Mutex::new(Some(BufWriter::with_capacity(WRITE_BUFFER_BYTES, file))),
            session: Mutex::new(session),
            event_count: AtomicU64::new(count),
        })
    }

    fn encode_payload(message: &impl Message) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::with_capacity(message.encoded_len());
        message
            .encode(&mut buf)
            .map_err(|e| StoreError::Io(io::Error::other(format!("encode event: {e}"))))?;
        Ok(buf)
    }
}

impl EventStore for FramedStore {
    fn append_one(&self, event: &Event) -> Result<(), StoreError> {
        let payload = Self::encode_payload(&EventRecord::from(event))?;

        let mut guard = self.writer.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| StoreError::Io(io::Error::other("store is closed")))?;
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&payload)?;
        drop(guard);

        self.event_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn append_batch(&self, events: &[Event]) -> Result<(), StoreError> {
        let batch = EventBatch {
            events: events.iter().map(EventRecord::from).collect(),
        };
        let payload = Self::encode_payload(&batch)?;

        let mut guard = self.writer.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| StoreError::Io(io::Error::other("store is closed")))?;
        writer.write_all(&BATCH_SENTINEL.to_le_bytes())?;
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        drop(guard);

        self.event_count.fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn scan(&self, filter: &EventFilter) -> Result<Scan, StoreError> {
        // Readers use their own handle; they observe data up to the last
        // flush without disturbing the writer.
        let mut scanner = FrameScanner::open(&self.events_path)?;
        let mut scan = Scan::default();
        let mut skipped = 0usize;

        loop {
            let event = match scanner.next_event() {
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
        let mut scanner = FrameScanner::open(&self.events_path)?;
        let mut goroutines = BTreeSet::new();
        loop {
            match scanner.next_event() {
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

/// Streaming frame reader over an event-data file.
///
/// Batch frames are decoded whole and their records handed out one at a time;
/// this keeps scans lazy without re-reading frames.
struct FrameScanner {
    reader: BufReader<File>,
    offset: u64,
    pending: std::vec::IntoIter<EventRecord>,
}

impl FrameScanner {
    fn open(path: &Path) -> Result<FrameScanner, StoreError> {
        let file = File::open(path)?;
        Ok(FrameScanner {
            reader: BufReader::new(file),
            offset: 0,
            pending: Vec::new().into_iter(),
        })
    }

    /// Read a little-endian u32, or None at a clean end of stream. A partial
    /// read is a truncated frame.
    fn read_u32(&mut self, frame_start: u64) -> Result<Option<u32>, StoreError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(StoreError::Parse {
                    offset: frame_start,
                    reason: format!("truncated frame header ({filled} of 4 bytes)"),
                });
            }
            filled += n;
        }
        self.offset += 4;
        Ok(Some(u32::from_le_bytes(buf)))
    }

    fn read_payload(&mut self, len: u32, frame_start: u64) -> Result<Vec<u8>, StoreError> {
        if len > MAX_FRAME_BYTES {
            return Err(StoreError::Parse {
                offset: frame_start,
                reason: format!("implausible frame length {len}"),
            });
        }
        let mut payload = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut payload)
            .map_err(|_| StoreError::Parse {
                offset: frame_start,
                reason: format!("truncated frame payload (want {len} bytes)"),
            })?;
        self.offset += u64::from(len);
        Ok(payload)
    }

    fn next_event(&mut self) -> Result<Option<Event>, StoreError> {
        if let Some(record) = self.pending.next() {
            return record_to_event(&record, self.offset).map(Some);
        }

        let frame_start = self.offset;
        let Some(lead) = self.read_u32(frame_start)? else {
            return Ok(None);
        };

        if lead == BATCH_SENTINEL {
            let Some(len) = self.read_u32(frame_start)? else {
                return Err(StoreError::Parse {
                    offset: frame_start,
                    reason: "batch sentinel with no length".to_string(),
                });
            };
            let payload = self.read_payload(len, frame_start)?;
            let batch = EventBatch::decode(payload.as_slice()).map_err(|e| StoreError::Parse {
                offset: frame_start,
                reason: format!("unmarshal batch: {e}"),
            })?;
            self.pending = batch.events.into_iter();
            return self.next_event();
        }

        let payload = self.read_payload(lead, frame_start)?;
        let record = EventRecord::decode(payload.as_slice()).map_err(|e| StoreError::Parse {
            offset: frame_start,
            reason: format!("unmarshal event: {e}"),
        })?;
        record_to_event(&record, frame_start).map(Some)
    }
}

/// Count events by walking frames. Single-record payloads are skipped without
/// decoding; batch payloads are decoded to count their entries. Counting stops
/// at the first damaged frame, which is returned as a diagnostic.
fn count_events(path: &Path) -> Result<(u64, Option<StoreError>), StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, None)),
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut scanner = FrameScanner {
        reader: BufReader::new(file),
        offset: 0,
        pending: Vec::new().into_iter(),
    };

    let mut count = 0u64;
    loop {
        let frame_start = scanner.offset;
        let lead = match scanner.read_u32(frame_start) {
            Ok(Some(lead)) => lead,
            Ok(None) => return Ok((count, None)),
            Err(err) => return Ok((count, Some(err))),
        };
        if lead == BATCH_SENTINEL {
            let step = match scanner.read_u32(frame_start) {
                Ok(Some(len)) => scanner.read_payload(len, frame_start).and_then(|payload| {
                    EventBatch::decode(payload.as_slice()).map_err(|e| StoreError::Parse {
                        offset: frame_start,
                        reason: format!("unmarshal batch: {e}"),
                    })
                }),
                Ok(None) => Err(StoreError::Parse {
                    offset: frame_start,
                    reason: "batch sentinel with no length".to_string(),
                }),
                Err(err) => Err(err),
            };
            match step {
                Ok(batch) => count += batch.events.len() as u64,
                Err(err) => return Ok((count, Some(err))),
            }
        } else {
            if lead > MAX_FRAME_BYTES {
                return Ok((
                    count,
                    Some(StoreError::Parse {
                        offset: frame_start,
                        reason: format!("implausible frame length {lead}"),
                    }),
                ));
            }
            // Seeking past EOF succeeds silently, so bound-check against the
            // file length to catch a truncated tail record.
            if scanner.offset + u64::from(lead) > file_len {
                return Ok((
                    count,
                    Some(StoreError::Parse {
                        offset: frame_start,
                        reason: format!("truncated frame payload (want {lead} bytes)"),
                    }),
                ));
            }
            scanner.reader.seek_relative(i64::from(lead))?;
            scanner.offset += u64::from(lead);
            count += 1;
        }
    }
}
