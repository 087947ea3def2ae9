//! Record sources: the byte-stream of whole probe records the reader pool
//! consumes.
//!
//! The kernel side produces fixed-size records into a BPF ringbuffer. A
//! [`RecordSource`] hides where those bytes come from: in production a
//! ringbuffer poller ([`RingbufSource`]), in harnesses a plain channel
//! ([`ChannelSource`]). Closing a source wakes every blocked reader with a
//! clean end-of-stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use libbpf_rs::{MapHandle, RingBufferBuilder};
use tracing::{debug, error};

use crate::event::RECORD_SIZE;

/// One raw record as handed off by the kernel, before decode.
///
/// Records are nominally [`RECORD_SIZE`] bytes; a shorter submission is kept
/// as-is so the reader can count and skip it as a decode failure.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord {
    data: [u8; RECORD_SIZE],
    len: usize,
}

impl RawRecord {
    pub fn from_slice(data: &[u8]) -> RawRecord {
        let len = data.len().min(RECORD_SIZE);
        let mut buf = [0u8; RECORD_SIZE];
        buf[..len].copy_from_slice(&data[..len]);
        RawRecord { data: buf, len }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// End of stream; the source was closed or its producer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceClosed;

pub trait RecordSource: Send + Sync {
    /// Block until the next record or a clean end of stream.
    fn read(&self) -> Result<RawRecord, SourceClosed>;

    /// Stop producing. Blocked and future reads drain what is already
    /// buffered, then return [`SourceClosed`].
    fn close(&self);
}

/// Userspace monotonic clock, same timebase the probes stamp records with.
pub fn monotonic_now_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

/// Channel-backed source. The producing side holds the [`Sender`]; dropping
/// it ends the stream.
pub struct ChannelSource {
    rx: Receiver<RawRecord>,
}

impl ChannelSource {
    /// A source plus the sender that feeds it.
    pub fn unbounded() -> (Sender<RawRecord>, ChannelSource) {
        let (tx, rx) = unbounded();
        (tx, ChannelSource { rx })
    }
}

impl RecordSource for ChannelSource {
    fn read(&self) -> Result<RawRecord, SourceClosed> {
        self.rx.recv().map_err(|_| SourceClosed)
    }

    fn close(&self) {
        // Stream ends when the producing side drops its sender; nothing to do
        // from the consuming side.
    }
}

/// Poll interval for the ringbuffer consumer; bounds close() latency.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A BPF ringbuffer drained by a dedicated poller thread into a channel.
///
/// The libbpf consumer API is callback-based and its ring borrows the map, so
/// the poller owns both and forwards raw bytes; readers block on the channel
/// side. Closing stops the poller, which drops the sender, which ends the
/// stream once buffered records drain.
pub struct RingbufSource {
    rx: Receiver<RawRecord>,
    stop: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RingbufSource {
    pub fn spawn(map: MapHandle) -> anyhow::Result<RingbufSource> {
        let (tx, rx) = unbounded::<RawRecord>();
        let stop = Arc::new(AtomicBool::new(false));

        let poller_stop = stop.clone();
        let poller = thread::Builder::new()
            .name("ringbuf-poller".to_string())
            .spawn(move || {
                let cb_tx: Sender<RawRecord> = tx;
                let mut builder = RingBufferBuilder::new();
                if let Err(e) = builder.add(&map, move |data: &[u8]| {
                    if cb_tx.send(RawRecord::from_slice(data)).is_err() {
                        // Every reader is gone; stop the consumer loop.
                        return -1;
                    }
                    0
                }) {
                    error!(%e, "failed to register ringbuffer consumer");
                    return;
                }
                let ring = match builder.build() {
                    Ok(ring) => ring,
                    Err(e) => {
                        error!(%e, "failed to build ringbuffer consumer");
                        return;
                    }
                };

                while !poller_stop.load(Ordering::Acquire) {
                    match ring.poll(POLL_INTERVAL) {
                        Ok(_) => {}
                        Err(e) if e.kind() == libbpf_rs::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            error!(%e, "ringbuffer poll failed");
                            break;
                        }
                    }
                }
                debug!("ringbuffer poller exiting");
            })?;

        Ok(RingbufSource {
            rx,
            stop,
            poller: Mutex::new(Some(poller)),
        })
    }
}

impl RecordSource for RingbufSource {
    fn read(&self) -> Result<RawRecord, SourceClosed> {
        self.rx.recv().map_err(|_| SourceClosed)
    }

    fn close(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(poller) = self.poller.lock().unwrap().take() {
            let _ = poller.join();
        }
    }
}
