//! # File Transfer Engine
//!
//! Chunked streaming of a byte source into one port's transmit queue.
//! Backpressure is the correctness property: the engine never blocks the
//! worker, never drops payload bytes, and reports queue saturation instead
//! of spinning. Chunk size adapts to the port's baud rate so a slow wire is
//! fed small chunks and a fast one large.
//!
//! One job may run per port at a time. Every job registers with the
//! controller for its duration, which is what lets a port close cancel the
//! transfer atomically before the worker goes away.

use crate::bus::{Event, EventBus};
use crate::connection::ConnectionController;
use crate::error::{SendError, TransferError};
use crate::metrics::ThroughputWindow;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Back-off between retries when the transmit queue is full.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);
/// Successive queue-full retries before the job fails.
const MAX_RETRIES: u32 = 5;
/// Progress events are throttled to this interval...
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);
/// ...or to this fraction of the total size, whichever fires first.
const PROGRESS_FRACTION: f64 = 0.001;

/// Status of a transfer job as carried by `file.progress` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

/// Shared control surface of one transfer job. Held by the engine's task,
/// the controller's registry, and the caller.
pub struct TransferHandle {
    job_id: Uuid,
    port_id: String,
    cancelled: AtomicBool,
    paused: AtomicBool,
    bus: Arc<EventBus>,
}

impl TransferHandle {
    fn new(port_id: &str, bus: Arc<EventBus>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            port_id: port_id.to_string(),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            bus,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    /// Cancel immediately. Idempotent; the first call publishes
    /// `file.cancelled` so cancellation ordering is visible to subscribers
    /// before any subsequent lifecycle events (`port.closed` on a closing
    /// port follows it).
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!(port_id = %self.port_id, job_id = %self.job_id, "transfer cancelled");
            self.bus.publish_event(&Event::FileCancelled {
                port_id: self.port_id.clone(),
            });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Byte source for a transfer. Random access is not required.
pub type TransferSource = Box<dyn AsyncRead + Send + Unpin>;

pub struct FileTransferEngine {
    controller: Arc<ConnectionController>,
    bus: Arc<EventBus>,
}

impl FileTransferEngine {
    pub fn new(controller: Arc<ConnectionController>, bus: Arc<EventBus>) -> Self {
        Self { controller, bus }
    }

    /// Chunk size adapted to wire speed.
    pub fn chunk_size_for_baud(baud_rate: u32) -> usize {
        if baud_rate <= 57_600 {
            256
        } else if baud_rate <= 115_200 {
            1024
        } else {
            8192
        }
    }

    /// Stream a file from disk to `port_id`.
    pub async fn send_file(
        &self,
        port_id: &str,
        path: &std::path::Path,
    ) -> Result<Arc<TransferHandle>, TransferError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?
            .len();
        self.start(port_id, Box::new(file), total, None)
    }

    /// Start streaming `source` to `port_id`. Fails when the port is not
    /// open or already has an active transfer. `chunk_size` overrides the
    /// baud-rate table when given.
    pub fn start(
        &self,
        port_id: &str,
        source: TransferSource,
        total_bytes: u64,
        chunk_size: Option<usize>,
    ) -> Result<Arc<TransferHandle>, TransferError> {
        let baud = self
            .controller
            .config(port_id)
            .map(|c| c.baud_rate)
            .unwrap_or(115_200);
        let chunk_size = chunk_size.unwrap_or_else(|| Self::chunk_size_for_baud(baud)).max(1);

        let handle = Arc::new(TransferHandle::new(port_id, Arc::clone(&self.bus)));
        self.controller.register_transfer(Arc::clone(&handle))?;

        debug!(port_id, total_bytes, chunk_size, "transfer starting");
        let job = TransferJob {
            controller: Arc::clone(&self.controller),
            bus: Arc::clone(&self.bus),
            handle: Arc::clone(&handle),
            total_bytes,
            chunk_size,
        };
        tokio::spawn(job.run(source));
        Ok(handle)
    }
}

struct TransferJob {
    controller: Arc<ConnectionController>,
    bus: Arc<EventBus>,
    handle: Arc<TransferHandle>,
    total_bytes: u64,
    chunk_size: usize,
}

impl TransferJob {
    async fn run(self, mut source: TransferSource) {
        let port_id = self.handle.port_id().to_string();
        let mut sent: u64 = 0;
        let mut window = ThroughputWindow::default();
        let mut last_emit: Option<Instant> = None;
        let mut last_emit_bytes: u64 = 0;
        let mut buf = vec![0u8; self.chunk_size];

        self.publish_progress(sent, &mut window, TransferStatus::Running);

        loop {
            if self.handle.is_cancelled() {
                self.finish(None);
                return;
            }
            while self.handle.is_paused() && !self.handle.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            let n = match source.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    self.finish(Some(("source", err.to_string())));
                    return;
                }
            };
            if n == 0 {
                self.publish_progress(sent, &mut window, TransferStatus::Completed);
                self.bus.publish_event(&Event::FileCompleted {
                    port_id: port_id.clone(),
                    success: true,
                    message: format!("{sent} bytes transferred"),
                });
                info!(%port_id, sent, "transfer completed");
                self.finish(None);
                return;
            }

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            let mut attempts: u32 = 0;
            loop {
                if self.handle.is_cancelled() {
                    self.finish(None);
                    return;
                }
                match self.controller.send(&port_id, chunk.clone()) {
                    Ok(()) => break,
                    Err(SendError::QueueFull(_)) => {
                        attempts += 1;
                        if attempts > MAX_RETRIES {
                            warn!(%port_id, attempts, "transmit queue saturated, failing job");
                            self.finish(Some((
                                "queue_saturated",
                                TransferError::QueueSaturated(MAX_RETRIES).to_string(),
                            )));
                            return;
                        }
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    Err(SendError::NotOpen(_)) => {
                        // A closing port cancels us first; reaching this
                        // without the flag means the port vanished abruptly.
                        if !self.handle.is_cancelled() {
                            self.finish(Some(("port_closed", format!("{port_id} closed mid-transfer"))));
                        } else {
                            self.finish(None);
                        }
                        return;
                    }
                }
            }

            sent += n as u64;
            window.record(Instant::now(), n as u64);

            let due_time = last_emit.map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL);
            let due_growth = self.total_bytes > 0
                && (sent - last_emit_bytes) as f64 / self.total_bytes as f64 >= PROGRESS_FRACTION;
            if due_time || due_growth {
                self.publish_progress(sent, &mut window, TransferStatus::Running);
                last_emit = Some(Instant::now());
                last_emit_bytes = sent;
            }
        }
    }

    fn publish_progress(&self, sent: u64, window: &mut ThroughputWindow, status: TransferStatus) {
        let bps = window.bytes_per_second(Instant::now());
        let remaining = self.total_bytes.saturating_sub(sent) as f64;
        let eta_seconds = if bps > f64::EPSILON {
            remaining / bps
        } else {
            f64::INFINITY
        };
        self.bus.publish_event(&Event::FileProgress {
            port_id: self.handle.port_id().to_string(),
            total_bytes: self.total_bytes,
            sent_bytes: sent,
            throughput_bps: bps,
            eta_seconds,
            status,
        });
    }

    /// Deregister and, on failure, publish `file.error`. The source stream
    /// is dropped (closed) by the caller returning.
    fn finish(&self, failure: Option<(&str, String)>) {
        if let Some((kind, message)) = failure {
            self.bus.publish_event(&Event::FileError {
                port_id: self.handle.port_id().to_string(),
                error_kind: kind.to_string(),
                message,
            });
        }
        self.controller
            .deregister_transfer(self.handle.port_id(), self.handle.job_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::connection::CloseMode;
    use crate::transport::LoopbackTransport;
    use parking_lot::Mutex;
    use std::io::Cursor;

    #[test]
    fn chunk_size_follows_baud_table() {
        assert_eq!(FileTransferEngine::chunk_size_for_baud(9600), 256);
        assert_eq!(FileTransferEngine::chunk_size_for_baud(57_600), 256);
        assert_eq!(FileTransferEngine::chunk_size_for_baud(115_200), 1024);
        assert_eq!(FileTransferEngine::chunk_size_for_baud(921_600), 8192);
    }

    #[tokio::test]
    async fn transfer_completes_and_progress_is_monotonic() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(Arc::clone(&bus), None);
        let mut config = PortConfig::new("loop://xfer");
        config.read_timeout_ms = 5;
        controller
            .open_with_transport(config, Box::new(LoopbackTransport::new().with_echo(false)))
            .await
            .unwrap();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicBool::new(false));
        let p = Arc::clone(&progress);
        bus.subscribe("file.progress", move |_, event| {
            if let Event::FileProgress { sent_bytes, .. } = event {
                p.lock().push(*sent_bytes);
            }
        });
        let c = Arc::clone(&completed);
        bus.subscribe("file.completed", move |_, event| {
            if let Event::FileCompleted { success, .. } = event {
                assert!(*success);
                c.store(true, Ordering::SeqCst);
            }
        });

        let payload = vec![0x5Au8; 4096];
        let engine = FileTransferEngine::new(Arc::clone(&controller), Arc::clone(&bus));
        engine
            .start(
                "loop://xfer",
                Box::new(Cursor::new(payload)),
                4096,
                Some(1024),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(completed.load(Ordering::SeqCst));
        let seen = progress.lock().clone();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress not monotonic: {seen:?}");
        assert_eq!(*seen.last().unwrap(), 4096);

        // Registration is gone: a new transfer may start.
        assert!(engine
            .start("loop://xfer", Box::new(Cursor::new(vec![1u8])), 1, None)
            .is_ok());
        controller.close("loop://xfer", CloseMode::Force).await;
    }

    #[tokio::test]
    async fn second_transfer_on_same_port_is_rejected() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(Arc::clone(&bus), None);
        let mut config = PortConfig::new("loop://busy");
        config.read_timeout_ms = 5;
        // A short queue against a slow wire keeps the first job alive.
        config.tx_queue_limit = 4;
        let transport = LoopbackTransport::new()
            .with_echo(false)
            .with_write_delay(Duration::from_millis(50));
        controller
            .open_with_transport(config, Box::new(transport))
            .await
            .unwrap();

        let engine = FileTransferEngine::new(Arc::clone(&controller), Arc::clone(&bus));
        let _first = engine
            .start(
                "loop://busy",
                Box::new(Cursor::new(vec![0u8; 64 * 1024])),
                64 * 1024,
                Some(1024),
            )
            .unwrap();
        assert!(matches!(
            engine.start("loop://busy", Box::new(Cursor::new(vec![1u8])), 1, None),
            Err(TransferError::TransferActive(_))
        ));
        controller.close("loop://busy", CloseMode::Force).await;
    }

    #[tokio::test]
    async fn transfer_to_closed_port_is_rejected() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(Arc::clone(&bus), None);
        let engine = FileTransferEngine::new(controller, bus);
        assert!(matches!(
            engine.start("loop://nope", Box::new(Cursor::new(vec![1u8])), 1, None),
            Err(TransferError::PortNotOpen(_))
        ));
    }
}
