//! Ringbuffer reader pool.
//!
//! N threads share one [`RecordSource`]. Each loop iteration reads a whole
//! record, decodes it, stamps the ringbuffer queue-wait against the userspace
//! monotonic clock, and pushes the owned event into the bounded queue. A
//! closed source is the normal exit; decode failures are skipped without
//! consuming anything beyond the one record.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use crate::event::decode_record;
use crate::metrics::PipelineMetrics;
use crate::queue::QueueProducer;
use crate::source::{monotonic_now_ns, RecordSource, SourceClosed};

pub struct ReaderPool {
    threads: Vec<JoinHandle<()>>,
}

impl ReaderPool {
    /// Spawn `count` readers over a shared source. Each thread owns a clone
    /// of the queue producer; the producers all drop when the pool joins,
    /// which is what lets the processor pool see end-of-queue.
    pub fn spawn(
        count: usize,
        source: Arc<dyn RecordSource>,
        producer: QueueProducer,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<ReaderPool> {
        let mut threads = Vec::with_capacity(count);
        for id in 0..count {
            let source = source.clone();
            let producer = producer.clone();
            let metrics = metrics.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("reader-{id}"))
                    .spawn(move || read_loop(id, &*source, &producer, &metrics))?,
            );
        }
        Ok(ReaderPool { threads })
    }

    /// Wait for every reader to hit end-of-stream.
    pub fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

fn read_loop(
    id: usize,
    source: &dyn RecordSource,
    producer: &QueueProducer,
    metrics: &PipelineMetrics,
) {
    debug!(reader = id, "reader running");
    loop {
        let record = match source.read() {
            Ok(record) => record,
            Err(SourceClosed) => {
                info!(reader = id, "record source closed, exiting");
                return;
            }
        };
        metrics.note_read();

        let event = match decode_record(record.bytes()) {
            Ok(event) => event,
            Err(err) => {
                warn!(reader = id, %err, "skipping undecodable record");
                metrics.note_decode_failure();
                continue;
            }
        };

        // Queue wait is how long the record sat in the ringbuffer: userspace
        // monotonic now minus the kernel stamp, same timebase.
        let now = monotonic_now_ns();
        if now >= event.timestamp {
            metrics.note_queue_wait(now - event.timestamp);
        } else {
            trace!(
                reader = id,
                skew = event.timestamp - now,
                "event timestamp ahead of userspace clock"
            );
        }

        if producer.push(event).is_err() {
            // Every processor is gone; nothing downstream to feed.
            warn!(reader = id, "event queue disconnected, exiting");
            return;
        }
    }
}
