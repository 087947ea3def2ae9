//! Runtime configuration.
//!
//! This struct carries everything the monitor needs, separated from CLI
//! parsing concerns. Validation happens once at startup; a bad value aborts
//! before anything is attached.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::event::EventKind;
use crate::processor::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::storage::StorageFormat;

#[derive(Debug, Clone)]
pub struct Config {
    /// PID of a running process to attach to.
    pub pid: Option<u32>,
    /// Path to a binary to attach to. Exactly one of `pid` / `binary`.
    pub binary: Option<PathBuf>,
    /// Pre-compiled BPF object carrying the runtime probes.
    pub bpf_object: PathBuf,
    /// Number of ringbuffer read workers.
    pub read_workers: usize,
    /// Number of event processing workers.
    pub process_workers: usize,
    /// Events per storage/broadcast batch.
    pub batch_size: usize,
    /// Deadline after which a partial batch flushes anyway.
    pub batch_flush_interval: Duration,
    /// Capacity of the reader-to-processor queue.
    pub queue_capacity: usize,
    /// Whether the web API server and live websocket run.
    pub web_enabled: bool,
    /// TCP port for the web API server.
    pub web_port: u16,
    /// Storage format name; see [`StorageFormat::parse`].
    pub storage_format: String,
    /// Base directory for session data.
    pub storage_dir: PathBuf,
    /// Per-probe sampling rates as integer percent.
    pub sampling_rates: BTreeMap<EventKind, u32>,
    /// Suppress per-event textual logging.
    pub silent: bool,
    /// Suffix appended to the final metrics file name.
    pub metric_file_suffix: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pid: None,
            binary: None,
            bpf_object: PathBuf::from("gosling.bpf.o"),
            read_workers: 3,
            process_workers: 5,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_flush_interval: DEFAULT_FLUSH_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            web_enabled: false,
            web_port: 8080,
            storage_format: "binary".to_string(),
            storage_dir: PathBuf::from("./sessions"),
            sampling_rates: BTreeMap::new(),
            silent: false,
            metric_file_suffix: String::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.read_workers == 0 {
            bail!("read workers must be positive");
        }
        if self.process_workers == 0 {
            bail!("process workers must be positive");
        }
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if self.batch_flush_interval.is_zero() {
            bail!("batch flush interval must be positive");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be positive");
        }
        if self.pid.is_none() && self.binary.is_none() {
            bail!("either a PID or a binary path must be provided");
        }
        if self.pid.is_some() && self.binary.is_some() {
            bail!("only one of a PID or a binary path can be provided");
        }
        StorageFormat::parse(&self.storage_format)?;
        Ok(())
    }

    /// Whether processors render each event as a log line.
    pub fn log_events(&self) -> bool {
        !self.web_enabled && !self.silent
    }
}
