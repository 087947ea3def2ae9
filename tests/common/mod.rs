//! Shared helpers for integration tests.

#![allow(dead_code)] // Not every test binary uses every helper.

use gosling::event::{EventKind, ATTRIBUTE_SLOTS, RECORD_SIZE};
use gosling::source::RawRecord;
use gosling::storage::Event;

/// Encode a wire record the way the probes lay it out.
pub fn encode_record(
    timestamp: u64,
    kind: u32,
    probe_duration_ns: u32,
    goroutine: u32,
    parent_goroutine: u32,
    attributes: [u64; ATTRIBUTE_SLOTS],
) -> RawRecord {
    let mut buf = [0u8; RECORD_SIZE];
    buf[0..8].copy_from_slice(&timestamp.to_le_bytes());
    buf[8..12].copy_from_slice(&kind.to_le_bytes());
    buf[12..16].copy_from_slice(&probe_duration_ns.to_le_bytes());
    buf[16..20].copy_from_slice(&goroutine.to_le_bytes());
    buf[20..24].copy_from_slice(&parent_goroutine.to_le_bytes());
    for (i, attr) in attributes.iter().enumerate() {
        buf[24 + i * 8..32 + i * 8].copy_from_slice(&attr.to_le_bytes());
    }
    RawRecord::from_slice(&buf)
}

pub fn make_event(
    timestamp: u64,
    event_type: EventKind,
    goroutine: u32,
    parent_goroutine: u32,
    attributes: [u64; ATTRIBUTE_SLOTS],
) -> Event {
    Event {
        timestamp,
        event_type,
        goroutine,
        parent_goroutine,
        attributes,
    }
}
