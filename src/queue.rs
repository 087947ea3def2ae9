//! Bounded queue between the reader and processor pools.
//!
//! Multi-producer multi-consumer with blocking enqueue, so a slow processor
//! pool backpressures readers instead of growing memory. The depth counter is
//! the pipeline's main observable: it is what the metrics sampler reports as
//! events-waiting-processing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::event::RuntimeEvent;

/// Default queue capacity. Large enough to ride out flush stalls at
/// millions of events per second; harnesses shrink it to provoke
/// backpressure.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 20;

pub struct EventQueue {
    tx: Sender<RuntimeEvent>,
    rx: Receiver<RuntimeEvent>,
    depth: Arc<AtomicUsize>,
}

/// Enqueue side, one clone per reader. The stream ends for consumers when
/// every producer has been dropped.
#[derive(Clone)]
pub struct QueueProducer {
    tx: Sender<RuntimeEvent>,
    depth: Arc<AtomicUsize>,
}

/// Dequeue side, one clone per processor.
#[derive(Clone)]
pub struct QueueConsumer {
    rx: Receiver<RuntimeEvent>,
    depth: Arc<AtomicUsize>,
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> EventQueue {
        let (tx, rx) = bounded(capacity);
        EventQueue {
            tx,
            rx,
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn producer(&self) -> QueueProducer {
        QueueProducer {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }

    pub fn consumer(&self) -> QueueConsumer {
        QueueConsumer {
            rx: self.rx.clone(),
            depth: self.depth.clone(),
        }
    }

    /// Shared depth counter, for the metrics sampler.
    pub fn depth_handle(&self) -> Arc<AtomicUsize> {
        self.depth.clone()
    }
}

impl QueueProducer {
    /// Blocking enqueue. Errors only when every consumer is gone.
    pub fn push(&self, event: RuntimeEvent) -> Result<(), crossbeam_channel::SendError<RuntimeEvent>> {
        self.tx.send(event)?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl QueueConsumer {
    /// The raw receiver, for use in a worker's select loop. Callers must pair
    /// every received event with a [`QueueConsumer::note_dequeued`].
    pub(crate) fn receiver(&self) -> &Receiver<RuntimeEvent> {
        &self.rx
    }

    pub(crate) fn note_dequeued(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}
