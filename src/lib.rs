//! Gosling - live observation of Go runtime behavior from the kernel side.
//!
//! Uprobes at known `runtime.*` entry points emit fixed-layout records into a
//! BPF ringbuffer; this library turns that high-rate stream into a correctly
//! ordered, bounded, durable, and broadcastable event feed.
//!
//! # Modules
//!
//! - [`event`] - wire record decode and the event taxonomies
//! - [`source`] - record sources (ringbuffer poller, channel-backed harness)
//! - [`queue`] - the bounded reader-to-processor queue
//! - [`reader`] / [`processor`] - the two worker pools
//! - [`storage`] - session stores (framed and textual encoders) and manager
//! - [`broadcast`] - live viewer fan-out
//! - [`api`] - HTTP and websocket surface
//! - [`metrics`] - counters, sampler, terminal dump
//! - [`monitor`] - orchestration and shutdown sequencing
//!
//! # Example
//!
//! ```no_run
//! use gosling::{monitor, Config};
//!
//! let config = Config {
//!     pid: Some(4242),
//!     web_enabled: true,
//!     ..Config::default()
//! };
//! monitor::run(config).expect("monitoring failed");
//! ```

pub mod api;
pub mod attach;
pub mod broadcast;
pub mod config;
pub mod event;
pub mod metrics;
pub mod monitor;
pub mod processor;
pub mod queue;
pub mod reader;
pub mod sampling;
pub mod source;
pub mod storage;

// Re-export for convenience
pub use config::Config;
pub use monitor::{Pipeline, PipelineSummary};
pub use storage::{Event, EventFilter, EventStore, Session, SessionManager, StorageFormat};
