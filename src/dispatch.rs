//! # UI Dispatcher (fast-path throttle)
//!
//! The fast path can deliver thousands of small reads per second per port —
//! far more events than a UI can usefully render. This dispatcher is the
//! single registered fast-path consumer: it buffers `(port_id, bytes,
//! timestamp)` entries per port and flushes each port's buffer every 30 ms
//! as one coalesced delivery.
//!
//! Ordering: within one port the flushed chunks match arrival order; across
//! ports no order is defined. Memory is bounded: a per-port cap discards the
//! oldest pending chunks and counts the overflow, so a stalled or paused UI
//! can never grow the buffer without limit.

use crate::connection::FastPathSink;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Flush tick for pending buffers.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(30);
/// Pending-bytes cap per port; oldest chunks are dropped beyond it.
const PER_PORT_CAP: usize = 4 * 1024 * 1024;

/// One coalesced delivery: every chunk received on `port_id` since the last
/// flush, in arrival order.
#[derive(Debug, Clone)]
pub struct UiBatch {
    pub port_id: String,
    pub chunks: Vec<(u64, Bytes)>,
}

impl UiBatch {
    /// Total payload size across chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|(_, b)| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Concatenate the chunks for consumers that want one contiguous run.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for (_, chunk) in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

type UiConsumer = Arc<dyn Fn(UiBatch) + Send + Sync>;

#[derive(Default)]
struct PortBuffer {
    entries: Vec<(u64, Bytes)>,
    pending_bytes: usize,
}

struct DispatchShared {
    buffers: Mutex<HashMap<String, PortBuffer>>,
    consumer: RwLock<Option<UiConsumer>>,
    paused: AtomicBool,
    dropped: AtomicU64,
}

impl DispatchShared {
    fn push(&self, port_id: &str, bytes: Bytes, timestamp_ns: u64) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(port_id.to_string()).or_default();
        buffer.pending_bytes += bytes.len();
        buffer.entries.push((timestamp_ns, bytes));
        while buffer.pending_bytes > PER_PORT_CAP && !buffer.entries.is_empty() {
            let (_, old) = buffer.entries.remove(0);
            buffer.pending_bytes -= old.len();
            self.dropped.fetch_add(old.len() as u64, Ordering::Relaxed);
        }
    }

    fn flush(&self) {
        let drained: Vec<(String, PortBuffer)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .filter(|(_, b)| !b.entries.is_empty())
                .map(|(port, b)| (port.clone(), std::mem::take(b)))
                .collect()
        };
        if drained.is_empty() {
            return;
        }
        let Some(consumer) = self.consumer.read().clone() else {
            return;
        };
        for (port_id, buffer) in drained {
            consumer(UiBatch {
                port_id,
                chunks: buffer.entries,
            });
        }
    }
}

/// Time-batched delivery of fast-path payloads to a single consumer.
pub struct UiDispatcher {
    shared: Arc<DispatchShared>,
    timer: JoinHandle<()>,
}

impl UiDispatcher {
    /// Spawn the flush timer. Must run inside a tokio runtime.
    pub fn start() -> Self {
        let shared = Arc::new(DispatchShared {
            buffers: Mutex::new(HashMap::new()),
            consumer: RwLock::new(None),
            paused: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        let tick = Arc::clone(&shared);
        let timer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !tick.paused.load(Ordering::Relaxed) {
                    tick.flush();
                }
            }
        });

        Self { shared, timer }
    }

    /// The single delivery target for coalesced batches.
    pub fn set_consumer<F>(&self, consumer: F)
    where
        F: Fn(UiBatch) + Send + Sync + 'static,
    {
        *self.shared.consumer.write() = Some(Arc::new(consumer));
    }

    /// Sink to register with the controller's fast path.
    pub fn sink(&self) -> FastPathSink {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |port_id, bytes, timestamp_ns| {
            shared.push(port_id, bytes, timestamp_ns);
        })
    }

    /// Suspend flushing; entries keep accumulating under the per-port cap.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
    }

    /// Deliver everything pending synchronously, regardless of pause state.
    pub fn drain(&self) {
        self.shared.flush();
    }

    /// Bytes discarded by the per-port cap since start.
    pub fn dropped_total(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for UiDispatcher {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
