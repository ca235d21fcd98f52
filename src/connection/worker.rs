//! # Connection Worker
//!
//! One task per open connection. Each loop iteration drains the transmit
//! queue, performs one bounded read, and routes received bytes three ways:
//! into the receive ring (telemetry window), through the packet parser onto
//! the bus, and directly to the fast-path sink. Small reads are coalesced
//! into one `port.data_received` emission (≤8 KiB, ≤30 ms) to keep bus
//! pressure off the hot path without reordering bytes.
//!
//! The loop is cooperative: a stop flag is checked every iteration and
//! between queued chunks, so close latency is bounded by one transport
//! operation. A graceful stop flushes pending transmit data; a forced stop
//! discards it.

use super::{CloseMode, SharedFastPath, WorkerControl};
use crate::buffer::{BoundedQueue, RingBuffer};
use crate::bus::{Event, EventBus};
use crate::error::{ReadError, WriteError};
use crate::metrics::PortStats;
use crate::parser::PacketParser;
use crate::transport::SerialTransport;
use crate::utils::current_timestamp_ns;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum bytes requested per transport read.
const READ_MAX: usize = 4096;
/// Idle sleep to cap CPU when neither side has work.
const IDLE_SLEEP: Duration = Duration::from_millis(1);
/// Coalescing thresholds for `port.data_received` emission.
const BATCH_MAX_BYTES: usize = 8 * 1024;
const BATCH_MAX_AGE: Duration = Duration::from_millis(30);
/// Bound on the graceful-close TX flush.
const DRAIN_LIMIT: Duration = Duration::from_millis(500);

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Stop flag observed; clean exit.
    Stopped,
    /// Transport fault; `port.error` has been published.
    Failed,
}

pub(crate) struct ConnectionWorker {
    port_id: String,
    transport: Box<dyn SerialTransport>,
    parser: Box<dyn PacketParser>,
    tx: Arc<BoundedQueue<Bytes>>,
    ring: Arc<RingBuffer>,
    stats: Arc<PortStats>,
    control: Arc<WorkerControl>,
    bus: Arc<EventBus>,
    fast_path: SharedFastPath,
    batch: BytesMut,
    batch_ts: u64,
    batch_started: Option<Instant>,
}

impl ConnectionWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        port_id: String,
        transport: Box<dyn SerialTransport>,
        parser: Box<dyn PacketParser>,
        tx: Arc<BoundedQueue<Bytes>>,
        ring: Arc<RingBuffer>,
        stats: Arc<PortStats>,
        control: Arc<WorkerControl>,
        bus: Arc<EventBus>,
        fast_path: SharedFastPath,
    ) -> Self {
        Self {
            port_id,
            transport,
            parser,
            tx,
            ring,
            stats,
            control,
            bus,
            fast_path,
            batch: BytesMut::new(),
            batch_ts: 0,
            batch_started: None,
        }
    }

    pub(crate) async fn run(mut self) -> WorkerExit {
        debug!(port_id = %self.port_id, "worker started");
        let exit = self.run_loop().await;
        self.flush_batch();
        if exit == WorkerExit::Stopped {
            if self.control.stop_requested() == Some(CloseMode::Drain) {
                self.drain_tx().await;
            } else {
                let dropped = self.tx.clear();
                if dropped > 0 {
                    debug!(port_id = %self.port_id, dropped, "forced close discarded tx chunks");
                }
            }
        }
        self.transport.close().await;
        debug!(port_id = %self.port_id, ?exit, "worker finished");
        exit
    }

    async fn run_loop(&mut self) -> WorkerExit {
        loop {
            if self.control.stop_requested().is_some() {
                return WorkerExit::Stopped;
            }

            let wrote = match self.pump_tx().await {
                Ok(wrote) => wrote,
                Err(err) => {
                    self.publish_error("write", &err.to_string());
                    return WorkerExit::Failed;
                }
            };

            let received = match self.transport.read(READ_MAX).await {
                Ok(bytes) if !bytes.is_empty() => {
                    self.handle_rx(bytes);
                    true
                }
                Ok(_) => false,
                Err(ReadError::Disconnected) => {
                    self.publish_error("disconnected", "transport disconnected");
                    return WorkerExit::Failed;
                }
                Err(err) => {
                    self.publish_error("read", &err.to_string());
                    return WorkerExit::Failed;
                }
            };

            self.flush_batch_if_due();

            if !wrote && !received {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
    }

    /// Drain queued chunks into the transport. A partial write puts the
    /// remainder back at the queue front and yields to the read side instead
    /// of spinning.
    async fn pump_tx(&mut self) -> Result<bool, WriteError> {
        let mut wrote = false;
        while let Some(chunk) = self.tx.try_pop() {
            match self.transport.write(&chunk).await {
                Ok(written) => {
                    if written > 0 {
                        wrote = true;
                        self.stats.add_tx(written as u64);
                        self.bus.publish_event(&Event::DataSent {
                            port_id: self.port_id.clone(),
                            timestamp_ns: current_timestamp_ns(),
                            bytes: chunk.slice(..written),
                        });
                    }
                    if written < chunk.len() {
                        self.tx.push_front(chunk.slice(written..));
                        break;
                    }
                }
                Err(err) => {
                    // Undelivered bytes are reported lost, never swallowed.
                    self.tx.push_front(chunk);
                    let pending = self.tx.len();
                    warn!(
                        port_id = %self.port_id,
                        pending_chunks = pending,
                        "write failed with pending tx: {err}"
                    );
                    return Err(err);
                }
            }
            if self.control.stop_requested().is_some() {
                break;
            }
        }
        Ok(wrote)
    }

    fn handle_rx(&mut self, bytes: Bytes) {
        let timestamp_ns = current_timestamp_ns();

        let (_, dropped) = self.ring.write(&bytes);
        if dropped > 0 {
            self.stats.add_ring_dropped(dropped as u64);
        }

        let packets = self.parser.feed(&bytes);
        if !packets.is_empty() {
            self.stats.add_packets(packets.len() as u64);
            for packet in packets {
                self.bus.publish_event(&Event::Packet(packet));
            }
        }

        // Fast path first-class: raw bytes go straight to the sink, in
        // arrival order, before any coalescing.
        if let Some(sink) = self.fast_path.read().clone() {
            sink(&self.port_id, bytes.clone(), timestamp_ns);
        }

        self.stats.add_rx(bytes.len() as u64);

        if self.batch.is_empty() {
            self.batch_ts = timestamp_ns;
            self.batch_started = Some(Instant::now());
        }
        self.batch.extend_from_slice(&bytes);
        if self.batch.len() >= BATCH_MAX_BYTES {
            self.flush_batch();
        }
    }

    fn flush_batch_if_due(&mut self) {
        if let Some(started) = self.batch_started {
            if started.elapsed() >= BATCH_MAX_AGE {
                self.flush_batch();
            }
        }
    }

    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let bytes = self.batch.split().freeze();
        self.batch_started = None;
        self.bus.publish_event(&Event::DataReceived {
            port_id: self.port_id.clone(),
            timestamp_ns: self.batch_ts,
            bytes,
        });
    }

    /// Graceful-close flush of pending transmit chunks, bounded in time so a
    /// dead wire cannot hold the close hostage.
    async fn drain_tx(&mut self) {
        let deadline = Instant::now() + DRAIN_LIMIT;
        while let Some(chunk) = self.tx.try_pop() {
            if Instant::now() >= deadline {
                self.tx.push_front(chunk);
                break;
            }
            let mut offset = 0;
            while offset < chunk.len() {
                match self.transport.write(&chunk[offset..]).await {
                    Ok(0) => return,
                    Ok(n) => offset += n,
                    Err(err) => {
                        warn!(port_id = %self.port_id, "drain aborted: {err}");
                        return;
                    }
                }
                if Instant::now() >= deadline {
                    return;
                }
            }
            self.stats.add_tx(chunk.len() as u64);
            self.bus.publish_event(&Event::DataSent {
                port_id: self.port_id.clone(),
                timestamp_ns: current_timestamp_ns(),
                bytes: chunk,
            });
        }
        let leftover = self.tx.clear();
        if leftover > 0 {
            warn!(port_id = %self.port_id, leftover, "drain deadline left chunks unsent");
        }
    }

    fn publish_error(&mut self, kind: &str, message: &str) {
        self.flush_batch();
        self.bus.publish_event(&Event::PortError {
            port_id: self.port_id.clone(),
            error_kind: kind.to_string(),
            message: message.to_string(),
        });
    }
}
