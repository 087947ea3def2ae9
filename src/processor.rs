//! Processor pool: time-and-count batching between the queue and the
//! downstream sinks.
//!
//! M workers each own a reusable batch buffer and a flush deadline. A batch
//! flushes when it reaches capacity or when the deadline fires, whichever is
//! first; a flush appends the whole batch to the session store as one call
//! and hands a copy to the broadcast hub as one frame. On shutdown a worker
//! drains the queue fully and flushes the final partial batch, so nothing is
//! lost to the pipeline itself.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{after, select};
use tracing::{debug, error, info};

use crate::broadcast::Hub;
use crate::event::RuntimeEvent;
use crate::metrics::PipelineMetrics;
use crate::queue::QueueConsumer;
use crate::storage::{Event, EventStore};

/// Default batch capacity.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default flush deadline.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Sinks a worker flushes into; both are optional so the pipeline runs
/// headless when web mode is off.
#[derive(Clone, Default)]
pub struct Sinks {
    pub store: Option<Arc<dyn EventStore>>,
    pub hub: Option<Arc<Hub>>,
}

pub struct ProcessorPool {
    threads: Vec<JoinHandle<()>>,
}

impl ProcessorPool {
    pub fn spawn(
        count: usize,
        consumer: QueueConsumer,
        sinks: Sinks,
        metrics: Arc<PipelineMetrics>,
        batch_size: usize,
        flush_interval: Duration,
        log_events: bool,
    ) -> Result<ProcessorPool> {
        let mut threads = Vec::with_capacity(count);
        for id in 0..count {
            let consumer = consumer.clone();
            let sinks = sinks.clone();
            let metrics = metrics.clone();
            threads.push(thread::Builder::new().name(format!("processor-{id}")).spawn(
                move || {
                    process_loop(
                        id,
                        &consumer,
                        &sinks,
                        &metrics,
                        batch_size,
                        flush_interval,
                        log_events,
                    )
                },
            )?);
        }
        Ok(ProcessorPool { threads })
    }

    /// Wait for every worker to drain and flush.
    pub fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

fn process_loop(
    id: usize,
    consumer: &QueueConsumer,
    sinks: &Sinks,
    metrics: &PipelineMetrics,
    batch_size: usize,
    flush_interval: Duration,
    log_events: bool,
) {
    debug!(processor = id, "processor running");
    let mut batch: Vec<Event> = Vec::with_capacity(batch_size);
    let mut deadline = after(flush_interval);

    loop {
        select! {
            recv(consumer.receiver()) -> msg => match msg {
                Ok(raw) => {
                    consumer.note_dequeued();
                    ingest(raw, &mut batch, metrics, log_events, id);
                    if batch.len() >= batch_size {
                        flush(id, &mut batch, sinks, metrics);
                        deadline = after(flush_interval);
                    }
                }
                Err(_) => {
                    // Producers are gone and the queue is drained.
                    flush(id, &mut batch, sinks, metrics);
                    info!(processor = id, "queue drained, exiting");
                    return;
                }
            },
            recv(deadline) -> _ => {
                flush(id, &mut batch, sinks, metrics);
                deadline = after(flush_interval);
            }
        }
    }
}

fn ingest(
    raw: RuntimeEvent,
    batch: &mut Vec<Event>,
    metrics: &PipelineMetrics,
    log_events: bool,
    id: usize,
) {
    let start = Instant::now();
    let event = Event::from(raw);
    batch.push(event);
    metrics.note_processed(raw.kind, raw.probe_duration_ns, start.elapsed().as_nanos() as u64);

    if log_events {
        info!(
            processor = id,
            ts = raw.timestamp,
            lat = raw.probe_duration_ns,
            "{}",
            raw.describe()
        );
    }
}

/// Append the batch as one store call, hand a copy to the hub as one frame,
/// account the flush, and reuse the buffer. A storage failure loses this
/// batch only: it is logged, counted, and the worker moves on.
fn flush(id: usize, batch: &mut Vec<Event>, sinks: &Sinks, metrics: &PipelineMetrics) {
    if batch.is_empty() {
        return;
    }
    let start = Instant::now();

    if let Some(store) = &sinks.store {
        if let Err(err) = store.append_batch(batch) {
            error!(processor = id, %err, events = batch.len(), "batch append failed, dropping batch");
            metrics.note_lost_batch(batch.len());
        }
    }
    if let Some(hub) = &sinks.hub {
        hub.broadcast_batch(batch.clone());
    }

    metrics.note_flush(start.elapsed().as_nanos() as u64);
    batch.clear();
}
