//! Live broadcast hub.
//!
//! Processors hand frames to the hub; a dedicated dispatcher thread
//! serializes each frame once and offers it to every subscriber's bounded
//! ring. A subscriber that cannot keep up loses its oldest frames first and
//! is evicted after two consecutive publishes that found its ring full.
//! Within one subscriber, frames always arrive in dispatch order.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::storage::Event;

/// Frames buffered per subscriber before the oldest are displaced.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Consecutive full publishes before a subscriber is evicted.
pub const SLOW_PUBLISH_LIMIT: u32 = 2;

/// A frame as dispatched to subscribers.
#[derive(Debug, Clone)]
pub enum Frame {
    Single(Event),
    Batch(Vec<Event>),
}

#[derive(Serialize)]
struct BatchFrame<'a> {
    r#type: &'static str,
    events: &'a [Event],
}

impl Frame {
    /// Serialize to the wire shape: a bare event object, or a discriminated
    /// batch object.
    fn to_json(&self) -> String {
        let result = match self {
            Frame::Single(event) => serde_json::to_string(event),
            Frame::Batch(events) => serde_json::to_string(&BatchFrame {
                r#type: "batch",
                events,
            }),
        };
        // Events are plain integers; serialization cannot fail for them.
        result.unwrap_or_default()
    }
}

/// One connected viewer.
///
/// The dispatcher pushes serialized frames into `frames`; the connection task
/// pops them in order and writes them to the socket. `closed` flips when the
/// hub evicts the subscriber or shuts down.
pub struct Subscriber {
    id: u64,
    frames: ArrayQueue<Arc<str>>,
    notify: Notify,
    closed: AtomicBool,
    slow_publishes: AtomicU32,
    dropped_frames: AtomicU64,
}

impl Subscriber {
    fn new(id: u64) -> Subscriber {
        Subscriber {
            id,
            frames: ArrayQueue::new(SUBSCRIBER_QUEUE_CAPACITY),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            slow_publishes: AtomicU32::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pop the next frame, oldest first.
    pub fn pop(&self) -> Option<Arc<str>> {
        self.frames.pop()
    }

    /// Wait until the dispatcher signals new frames or closure.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

pub struct Hub {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    tx: Mutex<Option<Sender<Frame>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Hub {
    /// Start the hub with its dispatcher thread.
    pub fn start() -> std::io::Result<Arc<Hub>> {
        let (tx, rx) = unbounded::<Frame>();
        let hub = Arc::new(Hub {
            subscribers: Mutex::new(Vec::new()),
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });

        let dispatcher_hub = hub.clone();
        let handle = thread::Builder::new()
            .name("broadcast-hub".to_string())
            .spawn(move || dispatch_loop(&dispatcher_hub, rx))?;
        *hub.dispatcher.lock().unwrap() = Some(handle);
        Ok(hub)
    }

    pub fn subscribe(&self) -> Arc<Subscriber> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber::new(id));
        self.subscribers.lock().unwrap().push(subscriber.clone());
        debug!(subscriber = id, "viewer subscribed");
        subscriber
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
            let subscriber = subscribers.swap_remove(pos);
            subscriber.close();
            debug!(subscriber = id, "viewer unsubscribed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Queue one event for broadcast.
    pub fn broadcast(&self, event: Event) {
        self.send(Frame::Single(event));
    }

    /// Queue a batch for broadcast as a single frame.
    pub fn broadcast_batch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.send(Frame::Batch(events));
    }

    fn send(&self, frame: Frame) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Stop dispatching: drain queued frames, then close every subscriber.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.drain(..) {
            subscriber.close();
        }
    }
}

fn dispatch_loop(hub: &Hub, rx: Receiver<Frame>) {
    while let Ok(frame) = rx.recv() {
        let payload: Arc<str> = Arc::from(frame.to_json());
        let mut subscribers = hub.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| {
            if subscriber.frames.force_push(payload.clone()).is_some() {
                // Ring was full: the oldest frame was displaced. Two full
                // publishes in a row and the viewer is evicted.
                subscriber.dropped_frames.fetch_add(1, Ordering::Relaxed);
                let slow = subscriber.slow_publishes.fetch_add(1, Ordering::Relaxed) + 1;
                if slow >= SLOW_PUBLISH_LIMIT {
                    warn!(
                        subscriber = subscriber.id,
                        dropped = subscriber.dropped_frames(),
                        "evicting slow viewer"
                    );
                    subscriber.close();
                    return false;
                }
            } else {
                subscriber.slow_publishes.store(0, Ordering::Relaxed);
            }
            subscriber.notify.notify_one();
            true
        });
    }
    debug!("broadcast dispatcher exiting");
}
