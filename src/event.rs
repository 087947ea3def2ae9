//! Wire-format runtime event records and the taxonomies they reference.
//!
//! The BPF probes emit one fixed-layout 64-byte record per fire. This module
//! owns the decode from raw ringbuffer bytes into [`RuntimeEvent`], plus the
//! closed enumerations the record fields refer to: event kinds, goroutine
//! states, and the runtime's element-kind taxonomy.

use std::borrow::Cow;
use std::fmt;

use plain::Plain;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one record as emitted by the probes.
pub const RECORD_SIZE: usize = 64;

/// Number of attribute slots carried by every record.
pub const ATTRIBUTE_SLOTS: usize = 5;

/// On-wire layout of a probe record, little-endian.
///
/// Field order and widths mirror the struct the BPF side submits to the
/// ringbuffer; `plain` lets us decode with a bounds-checked memcpy.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct wire_event {
    pub timestamp: u64,
    pub event_type: u32,
    pub probe_duration_ns: u32,
    pub goroutine: u32,
    pub parent_goroutine: u32,
    pub attributes: [u64; ATTRIBUTE_SLOTS],
}

unsafe impl Plain for wire_event {}

const _: () = assert!(std::mem::size_of::<wire_event>() == RECORD_SIZE);

/// Kind of a runtime event, one per instrumented runtime entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
#[repr(u32)]
pub enum EventKind {
    /// `runtime.casgstatus` - goroutine state transition.
    StateChange = 0,
    /// `runtime.makeslice` - slice allocation.
    MakeSlice = 1,
    /// `runtime.makemap` - map allocation.
    MakeMap = 2,
    /// `runtime.newobject` - heap object allocation.
    NewObject = 3,
    /// `runtime.newproc1` - goroutine creation.
    NewGoroutine = 4,
    /// `runtime.goexit1` - goroutine exit.
    GoExit = 5,
}

/// Number of distinct event kinds; sized for per-kind counter arrays.
pub const EVENT_KIND_COUNT: usize = 6;

/// All kinds, in wire order.
pub const EVENT_KINDS: [EventKind; EVENT_KIND_COUNT] = [
    EventKind::StateChange,
    EventKind::MakeSlice,
    EventKind::MakeMap,
    EventKind::NewObject,
    EventKind::NewGoroutine,
    EventKind::GoExit,
];

impl EventKind {
    pub fn from_u32(v: u32) -> Option<EventKind> {
        match v {
            0 => Some(EventKind::StateChange),
            1 => Some(EventKind::MakeSlice),
            2 => Some(EventKind::MakeMap),
            3 => Some(EventKind::NewObject),
            4 => Some(EventKind::NewGoroutine),
            5 => Some(EventKind::GoExit),
            _ => None,
        }
    }

    /// The probe name used in sampling-rate specs and metrics output.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StateChange => "casgstatus",
            EventKind::MakeSlice => "makeslice",
            EventKind::MakeMap => "makemap",
            EventKind::NewObject => "newobject",
            EventKind::NewGoroutine => "newgoroutine",
            EventKind::GoExit => "goexit",
        }
    }

    pub fn from_name(name: &str) -> Option<EventKind> {
        EVENT_KINDS.iter().copied().find(|k| k.name() == name)
    }
}

impl TryFrom<u64> for EventKind {
    type Error = String;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        u32::try_from(v)
            .ok()
            .and_then(EventKind::from_u32)
            .ok_or_else(|| format!("unknown event kind: {v}"))
    }
}

impl From<EventKind> for u64 {
    fn from(kind: EventKind) -> u64 {
        kind as u64
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded probe record, as it flows through the pipeline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub timestamp: u64,
    pub kind: EventKind,
    pub probe_duration_ns: u32,
    pub goroutine: u32,
    pub parent_goroutine: u32,
    pub attributes: [u64; ATTRIBUTE_SLOTS],
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("short record: {0} bytes, want {RECORD_SIZE}")]
    ShortRecord(usize),
    #[error("unknown event kind: {0}")]
    UnknownKind(u32),
}

/// Decode one raw ringbuffer record.
///
/// Consumes exactly one record worth of bytes or fails without side effects;
/// callers skip the record and keep reading on error.
pub fn decode_record(data: &[u8]) -> Result<RuntimeEvent, DecodeError> {
    let mut raw = wire_event::default();
    plain::copy_from_bytes(&mut raw, data).map_err(|_| DecodeError::ShortRecord(data.len()))?;

    let kind = EventKind::from_u32(raw.event_type).ok_or(DecodeError::UnknownKind(raw.event_type))?;

    Ok(RuntimeEvent {
        timestamp: raw.timestamp,
        kind,
        probe_duration_ns: raw.probe_duration_ns,
        goroutine: raw.goroutine,
        parent_goroutine: raw.parent_goroutine,
        attributes: raw.attributes,
    })
}

/// Goroutine scheduler states, as stored in the runtime's g struct.
pub fn state_name(state: u64) -> &'static str {
    match state {
        0 => "idle",
        1 => "runnable",
        2 => "running",
        3 => "syscall",
        4 => "waiting",
        5 => "moribund",
        6 => "dead",
        7 => "enqueue",
        8 => "copystack",
        9 => "preempted",
        _ => "unknown",
    }
}

/// Terminal goroutine state.
pub const STATE_DEAD: u64 = 6;

/// Render a runtime element kind the way the runtime's type taxonomy names it.
pub fn elem_kind_name(kind: u64) -> Cow<'static, str> {
    let name = match kind {
        0 => "INVALID",
        1 => "bool",
        2 => "int",
        3 => "int8",
        4 => "int16",
        5 => "int32",
        6 => "int64",
        7 => "uint",
        8 => "uint8",
        9 => "uint16",
        10 => "uint32",
        11 => "uint64",
        12 => "uintptr",
        13 => "float32",
        14 => "float64",
        15 => "complex64",
        16 => "complex128",
        17 => "ARRAY",
        18 => "chan T",
        19 => "func",
        20 => "interface{}",
        21 => "map[K]V",
        22 => "*T",
        23 => "[]T",
        24 => "string",
        25 => "struct{}",
        26 => "unsafe.Pointer",
        _ => return Cow::Owned(format!("unknown({kind})")),
    };
    Cow::Borrowed(name)
}

impl RuntimeEvent {
    /// One-line human rendering, used for per-event logging outside web mode.
    pub fn describe(&self) -> String {
        let a = &self.attributes;
        match self.kind {
            EventKind::StateChange => format!(
                "goroutine {} state {} -> {}",
                a[2],
                state_name(a[0]),
                state_name(a[1])
            ),
            EventKind::MakeSlice => format!(
                "goroutine {} allocated slice []{} with length {} and capacity {}",
                self.goroutine,
                elem_kind_name(a[1]),
                a[2],
                a[3]
            ),
            EventKind::MakeMap => format!(
                "goroutine {} allocated map[{}]{} with initial capacity {}",
                self.goroutine,
                elem_kind_name(a[1]),
                elem_kind_name(a[3]),
                a[4]
            ),
            EventKind::NewObject => format!(
                "goroutine {} allocated object of size {} and kind {}",
                self.goroutine,
                a[0],
                elem_kind_name(a[1])
            ),
            EventKind::NewGoroutine => format!("goroutine {} created new goroutine {}", a[0], a[1]),
            EventKind::GoExit => format!("goroutine {} exited", a[0]),
        }
    }
}
