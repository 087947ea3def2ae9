use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gosling::config::Config;
use gosling::monitor;
use gosling::sampling::parse_sampling_rates;

#[derive(Debug, Parser)]
#[command(name = "gosling", about = "Observe Go runtime behavior via uprobes")]
struct Opts {
    /// Path to the Go binary to attach the probes to
    #[arg(short, long)]
    binary: Option<PathBuf>,
    /// PID of a running process to attach the probes to
    #[arg(short, long)]
    pid: Option<u32>,
    /// Pre-compiled BPF object carrying the runtime probes
    #[arg(long, default_value = "gosling.bpf.o")]
    bpf_object: PathBuf,
    /// Number of ringbuffer read workers
    #[arg(long, default_value_t = 3)]
    read_workers: usize,
    /// Number of event processing workers
    #[arg(long, default_value_t = 5)]
    process_workers: usize,
    /// Events per storage/broadcast batch
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,
    /// Batch flush deadline in milliseconds
    #[arg(long, default_value_t = 100)]
    batch_flush_interval_ms: u64,
    /// Enable web mode with the API server and live websocket
    #[arg(short, long)]
    web: bool,
    /// Port for the web API server
    #[arg(long, default_value_t = 8080)]
    web_port: u16,
    /// Storage format: binary (framed) or jsonl
    #[arg(long, default_value = "binary")]
    storage_format: String,
    /// Directory for storing session data
    #[arg(long, default_value = "./sessions")]
    storage_dir: PathBuf,
    /// Per-probe sampling rates, e.g. "makemap:0.01,newgoroutine:0.5"
    #[arg(long, default_value = "")]
    sampling_rates: String,
    /// Suppress per-event logging
    #[arg(short, long)]
    silent: bool,
    /// Suffix for the metrics file name
    #[arg(long, default_value = "")]
    metric_file_suffix: String,
    /// Verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let default_level = match opts.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Config {
        pid: opts.pid,
        binary: opts.binary,
        bpf_object: opts.bpf_object,
        read_workers: opts.read_workers,
        process_workers: opts.process_workers,
        batch_size: opts.batch_size,
        batch_flush_interval: std::time::Duration::from_millis(opts.batch_flush_interval_ms),
        web_enabled: opts.web,
        web_port: opts.web_port,
        storage_format: opts.storage_format,
        storage_dir: opts.storage_dir,
        sampling_rates: parse_sampling_rates(&opts.sampling_rates)?,
        silent: opts.silent,
        metric_file_suffix: opts.metric_file_suffix,
        ..Config::default()
    };
    config.validate()?;

    monitor::run(config)
}
