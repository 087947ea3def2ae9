//! Orchestration: wiring the pipeline and sequencing shutdown.
//!
//! The monitor owns every stop signal. Workers never signal each other; they
//! observe their upstream ending and drain. The shutdown order is fixed:
//! close the ringbuffer source (readers see EOF), join readers (queue
//! producers drop), join processors (queue drains, final batches flush),
//! close the store, stop the web surface, write the metrics file.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::bounded;
use tracing::{debug, info};

use crate::api::{default_viewer_config, ApiServer, ApiState};
use crate::attach::{bump_memlock_rlimit, resolve_executable, ProbeSession};
use crate::broadcast::Hub;
use crate::config::Config;
use crate::metrics::{MetricsCollector, PipelineMetrics, STATS_INTERVAL};
use crate::processor::{ProcessorPool, Sinks};
use crate::queue::EventQueue;
use crate::reader::ReaderPool;
use crate::sampling::SamplingSink;
use crate::source::RecordSource;
use crate::storage::{Session, SessionManager, StorageFormat};

/// Lifecycle of one monitoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Init,
    Attached,
    Running,
    Draining,
    Stopped,
}

fn enter(state: &mut MonitorState, next: MonitorState) {
    debug!(from = ?*state, to = ?next, "monitor state transition");
    *state = next;
}

/// Cumulative pipeline totals after a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Records read off the source.
    pub reads: u64,
    /// Records rejected at decode.
    pub decode_failures: u64,
    /// Events that reached a processor.
    pub processed: u64,
}

/// The reader and processor pools around one bounded queue.
///
/// Separate from [`run`] so harnesses can drive the pipeline with a synthetic
/// source and their own sinks.
pub struct Pipeline {
    source: Arc<dyn RecordSource>,
    readers: ReaderPool,
    processors: ProcessorPool,
    metrics: Arc<PipelineMetrics>,
    queue_depth: Arc<AtomicUsize>,
}

impl Pipeline {
    pub fn start(
        config: &Config,
        source: Arc<dyn RecordSource>,
        sinks: Sinks,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Pipeline> {
        let queue = EventQueue::with_capacity(config.queue_capacity);
        let queue_depth = queue.depth_handle();

        let readers = ReaderPool::spawn(
            config.read_workers,
            source.clone(),
            queue.producer(),
            metrics.clone(),
        )?;
        let processors = ProcessorPool::spawn(
            config.process_workers,
            queue.consumer(),
            sinks,
            metrics.clone(),
            config.batch_size,
            config.batch_flush_interval,
            config.log_events(),
        )?;
        // The pools hold the only channel endpoints now; dropping the queue
        // is what lets processors see EOF once the readers are done.
        drop(queue);

        Ok(Pipeline {
            source,
            readers,
            processors,
            metrics,
            queue_depth,
        })
    }

    /// Queue depth counter, for the metrics sampler.
    pub fn queue_depth(&self) -> Arc<AtomicUsize> {
        self.queue_depth.clone()
    }

    /// Drain and stop: close the source, join readers, join processors.
    /// Every event read before the close that decodes is in a sink when this
    /// returns.
    pub fn shutdown(self) -> PipelineSummary {
        self.source.close();
        self.readers.join();
        debug!("all readers done");
        self.processors.join();
        debug!("all processors done");

        PipelineSummary {
            reads: self.metrics.reads_total(),
            decode_failures: self.metrics.decode_failures(),
            processed: self.metrics.processed_total(),
        }
    }
}

/// Run a full monitoring session until SIGINT/SIGTERM.
pub fn run(config: Config) -> Result<()> {
    config.validate()?;
    let mut state = MonitorState::Init;

    bump_memlock_rlimit()?;
    let exe_path = resolve_executable(config.pid, config.binary.as_deref())?;
    match config.pid {
        Some(pid) => info!(pid, exe = %exe_path.display(), "attaching to PID"),
        None => info!(exe = %exe_path.display(), "attaching to executable"),
    }

    let mut probes = ProbeSession::load(&config.bpf_object, exe_path.clone(), config.pid)?;
    if !config.sampling_rates.is_empty() {
        probes
            .sampling_map()?
            .write_rates(&config.sampling_rates)
            .context("writing sampling rates")?;
    }
    probes.attach()?;
    let attached_at = Utc::now();
    info!(%attached_at, "probes attached");
    let source = Arc::new(probes.ringbuf_source()?);
    enter(&mut state, MonitorState::Attached);

    // Storage and web surface, when enabled.
    let metrics = PipelineMetrics::new();
    let mut web = None;
    let mut sinks = Sinks::default();
    if config.web_enabled {
        let manager = Arc::new(SessionManager::new(&config.storage_dir)?);
        let format = StorageFormat::parse(&config.storage_format)?;
        let session = Session::new(
            config.pid.map_or(0, |p| p as i32),
            exe_path.to_string_lossy(),
        );
        let store = manager.create(&session, format)?;
        let hub = Hub::start()?;
        info!(session = %session.id, format = %config.storage_format, "session created");

        sinks = Sinks {
            store: Some(store.clone()),
            hub: Some(hub.clone()),
        };
        web = Some((manager, session, store, hub));
    }

    let pipeline = Pipeline::start(&config, source, sinks, metrics.clone())?;

    let collector = MetricsCollector::new(
        metrics,
        pipeline.queue_depth(),
        STATS_INTERVAL,
        config.read_workers,
        config.process_workers,
    );
    let (sampler_stop, sampler_stop_rx) = bounded(1);
    let sampler = collector.spawn(sampler_stop_rx)?;

    let api = match &web {
        Some((manager, _, _, hub)) => {
            let api_state = ApiState {
                manager: manager.clone(),
                hub: hub.clone(),
                metrics: collector.clone(),
                viewer_config: Arc::new(RwLock::new(default_viewer_config())),
            };
            let api = ApiServer::bind(api_state, config.web_port)?;
            info!("web mode enabled: http://localhost:{}", config.web_port);
            Some(api)
        }
        None => None,
    };
    enter(&mut state, MonitorState::Running);

    // The monitor is the single owner of the stop signal.
    let (signal_tx, signal_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    })
    .context("installing signal handler")?;
    let _ = signal_rx.recv();
    info!("received stop signal, draining");
    enter(&mut state, MonitorState::Draining);

    let summary = pipeline.shutdown();
    info!(
        reads = summary.reads,
        processed = summary.processed,
        decode_failures = summary.decode_failures,
        "pipeline drained"
    );

    if let Some((manager, mut session, store, hub)) = web {
        session.end_time = Some(Utc::now());
        session.event_count = store.event_count();
        store.update_session(&session)?;
        store.close()?;
        manager.release(&session.id);
        hub.shutdown();
    }
    if let Some(api) = api {
        api.stop();
    }

    let _ = sampler_stop.send(());
    let _ = sampler.join();
    let metrics_path =
        collector.write_final(std::path::Path::new("."), &config.metric_file_suffix)?;
    info!(path = %metrics_path.display(), "metrics written");
    enter(&mut state, MonitorState::Stopped);

    Ok(())
}
