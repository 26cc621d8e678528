//! Delivery buffer
//!
//! Every payload channel shares one discipline: entries accumulate in
//! memory and are handed to the [`FlushSink`] as a batch when the size
//! threshold is reached, when the background timer fires, or when the
//! buffer shuts down. A size-triggered flush runs synchronously on the
//! pushing thread, which is the SDK's natural backpressure.
//!
//! Overlapping flushes are independent best-effort attempts: whichever
//! invocation swaps the entries out delivers them, the rest see an empty
//! buffer and return.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Payload category, one buffer per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Logs,
    Traces,
    Metrics,
}

impl Channel {
    /// Endpoint path segment for this channel
    pub fn path(&self) -> &'static str {
        match self {
            Channel::Logs => "logs",
            Channel::Traces => "traces",
            Channel::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// One buffered payload, opaque to the buffer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BufferEntry {
    payload: serde_json::Value,
}

impl BufferEntry {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// Downstream consumer of flushed batches
///
/// Implementations must swallow their own failures; the buffer treats
/// every `deliver` call as fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait FlushSink: Send + Sync {
    fn deliver(&self, channel: Channel, batch: Vec<BufferEntry>);
}

/// Bounded-latency batch buffer for one channel
pub struct DeliveryBuffer {
    channel: Channel,
    size_threshold: usize,
    flush_interval: Duration,
    sink: Arc<dyn FlushSink>,
    entries: Mutex<Vec<BufferEntry>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    pushed: AtomicU64,
    discarded: AtomicU64,
}

impl DeliveryBuffer {
    /// Create a buffer without starting its timer
    pub fn new(
        channel: Channel,
        size_threshold: usize,
        flush_interval: Duration,
        sink: Arc<dyn FlushSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            size_threshold: size_threshold.max(1),
            flush_interval,
            sink,
            entries: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    /// Start the background timer that flushes every interval
    pub fn spawn_timer(self: &Arc<Self>) {
        let mut slot = self.timer.lock();
        if slot.is_some() || self.flush_interval.is_zero() {
            return;
        }
        let buffer = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("kodama-flush-{}", self.channel))
            .spawn(move || buffer.run_timer());
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(e) => warn!(channel = %self.channel, error = %e, "failed to spawn flush timer"),
        }
    }

    fn run_timer(&self) {
        debug!(channel = %self.channel, interval_ms = self.flush_interval.as_millis() as u64, "flush timer running");
        loop {
            // Spurious wakeups only cost an early no-op flush.
            std::thread::park_timeout(self.flush_interval);
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
            self.flush();
        }
        debug!(channel = %self.channel, "flush timer stopped");
    }

    /// Append an entry, flushing synchronously once the threshold is hit
    pub fn push(&self, entry: BufferEntry) {
        if self.shutting_down.load(Ordering::Acquire) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %self.channel, "entry discarded after shutdown");
            return;
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);
        let should_flush = {
            let mut entries = self.entries.lock();
            entries.push(entry);
            entries.len() >= self.size_threshold
        };
        if should_flush {
            self.flush();
        }
    }

    /// Hand all pending entries to the sink
    pub fn flush(&self) {
        let batch = std::mem::take(&mut *self.entries.lock());
        if batch.is_empty() {
            return;
        }
        debug!(channel = %self.channel, entries = batch.len(), "flushing batch");
        self.sink.deliver(self.channel, batch);
    }

    /// Stop the timer and drain remaining entries synchronously
    ///
    /// Idempotent. Entries pushed after shutdown are discarded.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.timer.lock().take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!(channel = %self.channel, "flush timer panicked");
            }
        }
        self.flush();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entries accepted since creation
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Entries discarded because the buffer was already shut down
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}
