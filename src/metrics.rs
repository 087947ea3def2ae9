//! Pipeline metrics: hot-path counters, the fixed-cadence sampler, and the
//! terminal JSON dump.
//!
//! Workers touch nothing but atomics. The sampler swaps the per-interval
//! counters to zero at each cadence, derives rates and means, publishes one
//! coherent [`MetricsSnapshot`] for the HTTP surface, and appends to the
//! in-memory series that becomes `metrics_<timestamp>.json` at shutdown.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::{after, select, Receiver};
use serde::Serialize;
use tracing::info;

use crate::event::{EventKind, EVENT_KINDS, EVENT_KIND_COUNT};

/// Sampling cadence.
pub const STATS_INTERVAL: Duration = Duration::from_millis(1000);

/// Counters shared with the reader and processor pools.
///
/// "Interval" counters are swapped to zero by the sampler; "total" counters
/// are cumulative for drain accounting and the final dump.
#[derive(Default)]
pub struct PipelineMetrics {
    reads_interval: AtomicU64,
    processed_interval: AtomicU64,
    probe_ns_sum: AtomicU64,
    probe_ns_count: AtomicU64,
    convert_ns_sum: AtomicU64,
    convert_ns_count: AtomicU64,
    flush_ns_sum: AtomicU64,
    flush_count: AtomicU64,
    queue_wait_ns_sum: AtomicU64,
    queue_wait_count: AtomicU64,

    reads_total: AtomicU64,
    processed_total: AtomicU64,
    decode_failures: AtomicU64,
    lost_batches: AtomicU64,
    lost_events: AtomicU64,
    kind_counts: [AtomicU64; EVENT_KIND_COUNT],
}

impl PipelineMetrics {
    pub fn new() -> Arc<PipelineMetrics> {
        Arc::new(PipelineMetrics::default())
    }

    pub fn note_read(&self) {
        self.reads_interval.fetch_add(1, Ordering::Relaxed);
        self.reads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_queue_wait(&self, ns: u64) {
        self.queue_wait_ns_sum.fetch_add(ns, Ordering::Relaxed);
        self.queue_wait_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_processed(&self, kind: EventKind, probe_duration_ns: u32, convert_ns: u64) {
        self.processed_interval.fetch_add(1, Ordering::Relaxed);
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        self.probe_ns_sum
            .fetch_add(u64::from(probe_duration_ns), Ordering::Relaxed);
        self.probe_ns_count.fetch_add(1, Ordering::Relaxed);
        self.convert_ns_sum.fetch_add(convert_ns, Ordering::Relaxed);
        self.convert_ns_count.fetch_add(1, Ordering::Relaxed);
        self.kind_counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_flush(&self, ns: u64) {
        self.flush_ns_sum.fetch_add(ns, Ordering::Relaxed);
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_lost_batch(&self, events: usize) {
        self.lost_batches.fetch_add(1, Ordering::Relaxed);
        self.lost_events.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn reads_total(&self) -> u64 {
        self.reads_total.load(Ordering::Relaxed)
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    fn kind_totals(&self) -> BTreeMap<&'static str, u64> {
        EVENT_KINDS
            .iter()
            .map(|kind| (kind.name(), self.kind_counts[*kind as usize].load(Ordering::Relaxed)))
            .collect()
    }
}

/// One coherent view of the pipeline, as served by `/api/metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Events read from the ringbuffer per second.
    pub rps: f64,
    /// Events processed per second.
    pub pps: f64,
    /// Events waiting processing (queue depth).
    pub ewp: u64,
    /// Mean in-probe duration over the last interval, nanoseconds.
    pub lat: f64,
    /// Mean userspace processing time over the last interval, nanoseconds.
    pub prc: f64,
    /// Mean batch flush duration over the last interval, nanoseconds.
    pub bfl: f64,
    /// Mean ringbuffer-to-userspace queue wait over the last interval,
    /// nanoseconds.
    pub qwl: f64,
    /// Cumulative per-kind event counts.
    pub events_by_kind: BTreeMap<&'static str, u64>,
    /// Batches dropped on storage write failure.
    pub lost_batches: u64,
}

#[derive(Debug, Default, Serialize)]
struct MetricsSeries {
    rps: Vec<f64>,
    pps: Vec<f64>,
    ewp: Vec<f64>,
    lat: Vec<f64>,
    prc: Vec<f64>,
    bfl: Vec<f64>,
    qwl: Vec<f64>,
    ts: Vec<f64>,
}

#[derive(Serialize)]
struct MetricsDump<'a> {
    #[serde(flatten)]
    series: &'a MetricsSeries,
    events_by_kind: BTreeMap<&'static str, u64>,
    lost_batches: u64,
    lost_events: u64,
    decode_failures: u64,
}

struct SamplerState {
    series: MetricsSeries,
    last_depth: u64,
}

/// Fixed-cadence sampler over a [`PipelineMetrics`].
pub struct MetricsCollector {
    metrics: Arc<PipelineMetrics>,
    queue_depth: Arc<AtomicUsize>,
    interval: Duration,
    read_workers: usize,
    process_workers: usize,
    state: Mutex<SamplerState>,
    latest: RwLock<MetricsSnapshot>,
}

impl MetricsCollector {
    pub fn new(
        metrics: Arc<PipelineMetrics>,
        queue_depth: Arc<AtomicUsize>,
        interval: Duration,
        read_workers: usize,
        process_workers: usize,
    ) -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector {
            metrics,
            queue_depth,
            interval,
            read_workers: read_workers.max(1),
            process_workers: process_workers.max(1),
            state: Mutex::new(SamplerState {
                series: MetricsSeries::default(),
                last_depth: 0,
            }),
            latest: RwLock::new(MetricsSnapshot::default()),
        })
    }

    /// Take one sample: swap interval counters, derive rates and means,
    /// publish the snapshot, append to the series, log the stats lines.
    pub fn sample(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        let interval_secs = self.interval.as_secs_f64();

        let reads = m.reads_interval.swap(0, Ordering::Relaxed);
        let processed = m.processed_interval.swap(0, Ordering::Relaxed);
        let probe_sum = m.probe_ns_sum.swap(0, Ordering::Relaxed);
        let probe_count = m.probe_ns_count.swap(0, Ordering::Relaxed);
        let convert_sum = m.convert_ns_sum.swap(0, Ordering::Relaxed);
        let convert_count = m.convert_ns_count.swap(0, Ordering::Relaxed);
        let flush_sum = m.flush_ns_sum.swap(0, Ordering::Relaxed);
        let flush_count = m.flush_count.swap(0, Ordering::Relaxed);
        let wait_sum = m.queue_wait_ns_sum.swap(0, Ordering::Relaxed);
        let wait_count = m.queue_wait_count.swap(0, Ordering::Relaxed);

        let mean = |sum: u64, count: u64| if count == 0 { 0.0 } else { sum as f64 / count as f64 };
        let depth = self.queue_depth.load(Ordering::Relaxed) as u64;

        let snapshot = MetricsSnapshot {
            rps: reads as f64 / interval_secs,
            pps: processed as f64 / interval_secs,
            ewp: depth,
            lat: mean(probe_sum, probe_count),
            prc: mean(convert_sum, convert_count),
            bfl: mean(flush_sum, flush_count),
            qwl: mean(wait_sum, wait_count),
            events_by_kind: m.kind_totals(),
            lost_batches: m.lost_batches.load(Ordering::Relaxed),
        };

        {
            let mut state = self.state.lock().unwrap();
            let delta = depth as i64 - state.last_depth as i64;
            state.last_depth = depth;
            state.series.rps.push(snapshot.rps);
            state.series.pps.push(snapshot.pps);
            state.series.ewp.push(depth as f64);
            state.series.lat.push(snapshot.lat);
            state.series.prc.push(snapshot.prc);
            state.series.bfl.push(snapshot.bfl);
            state.series.qwl.push(snapshot.qwl);
            state
                .series
                .ts
                .push(Utc::now().timestamp_nanos_opt().unwrap_or(0) as f64);

            info!(
                "stats: rps {:.2} ev/s ({:.2}/worker), pps {:.2} ev/s ({:.2}/worker)",
                snapshot.rps,
                snapshot.rps / self.read_workers as f64,
                snapshot.pps,
                snapshot.pps / self.process_workers as f64,
            );
            info!("stats: queue depth {depth} ({delta:+})");
            info!(
                "stats: probe {:.0} ns, convert {:.0} ns, flush {:.0} ns, queue wait {:.0} ns",
                snapshot.lat, snapshot.prc, snapshot.bfl, snapshot.qwl,
            );
        }

        *self.latest.write().unwrap() = snapshot.clone();
        snapshot
    }

    /// The most recent snapshot, whole. Readers never see a half-updated one.
    pub fn latest(&self) -> MetricsSnapshot {
        self.latest.read().unwrap().clone()
    }

    /// Number of samples taken so far.
    pub fn sample_count(&self) -> usize {
        self.state.lock().unwrap().series.ts.len()
    }

    /// Run the sampler until `stop` fires, then take one final sample so the
    /// tail of the run is not lost.
    pub fn spawn(self: &Arc<Self>, stop: Receiver<()>) -> std::io::Result<JoinHandle<()>> {
        let collector = self.clone();
        thread::Builder::new()
            .name("metrics-sampler".to_string())
            .spawn(move || loop {
                let deadline = after(collector.interval);
                select! {
                    recv(stop) -> _ => {
                        collector.sample();
                        return;
                    }
                    recv(deadline) -> _ => {
                        collector.sample();
                    }
                }
            })
    }

    /// Write every sampled series plus final totals as one JSON file named
    /// `metrics_<UTC-timestamp>[_<suffix>].json` under `dir`.
    pub fn write_final(&self, dir: &std::path::Path, suffix: &str) -> Result<PathBuf> {
        let state = self.state.lock().unwrap();
        let dump = MetricsDump {
            series: &state.series,
            events_by_kind: self.metrics.kind_totals(),
            lost_batches: self.metrics.lost_batches.load(Ordering::Relaxed),
            lost_events: self.metrics.lost_events.load(Ordering::Relaxed),
            decode_failures: self.metrics.decode_failures(),
        };
        let data = serde_json::to_vec_pretty(&dump).context("marshaling metric data")?;

        let suffix = if suffix.is_empty() {
            String::new()
        } else {
            format!("_{suffix}")
        };
        let path = dir.join(format!(
            "metrics_{}{suffix}.json",
            Utc::now().format("%Y-%m-%d-%H-%M-%S")
        ));
        std::fs::write(&path, data).with_context(|| format!("writing metrics to {path:?}"))?;
        Ok(path)
    }
}
