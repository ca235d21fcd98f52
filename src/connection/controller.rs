//! # Connection Controller
//!
//! Singleton service owning every connection. All lifecycle transitions run
//! through here and are published on the bus; workers, macros, transfers,
//! and the UI address connections exclusively by port identifier.
//!
//! ## Responsibilities
//!
//! - Registry of `(config, transport, worker)` triples keyed by port id.
//! - Open/close with typed failures, bounded close joins, and cancellation
//!   of any registered file transfer before its port goes away.
//! - Targeted and broadcast send; broadcast iterates a snapshot of the key
//!   set so concurrent open/close cannot invalidate the iteration.
//! - Fast-path fan-out: one registered sink receives raw received bytes from
//!   every worker. The controller forwards without touching the payload.
//! - Worker-failure handling: `port.error` is already on the bus when a
//!   worker dies; the controller cancels the port's transfer, tears the
//!   entry down, and publishes `port.closed`.

use super::worker::{ConnectionWorker, WorkerExit};
use super::{CloseMode, ConnectionState, FastPathSink, SharedFastPath, WorkerControl};
use crate::buffer::{BoundedQueue, RingBuffer};
use crate::bus::{Event, EventBus};
use crate::config::PortConfig;
use crate::error::{GlobalErrorHandler, OpenError, SendError, TransferError};
use crate::file_transfer::TransferHandle;
use crate::metrics::{PortStats, PortStatsSnapshot};
use crate::parser::make_parser;
use crate::transport::{SerialTransport, TransportFactory};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Bounded wait for a worker to acknowledge a close request.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct ConnectionEntry {
    config: PortConfig,
    state: ConnectionState,
    tx: Arc<BoundedQueue<Bytes>>,
    ring: Arc<RingBuffer>,
    stats: Arc<PortStats>,
    control: Arc<WorkerControl>,
    join: Option<JoinHandle<()>>,
}

pub struct ConnectionController {
    bus: Arc<EventBus>,
    faults: Option<Arc<GlobalErrorHandler>>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    /// Ports with an open in flight; guards the check-then-insert window.
    opening: Mutex<HashSet<String>>,
    fast_path: SharedFastPath,
    transfers: Mutex<HashMap<String, Arc<TransferHandle>>>,
    current: Mutex<Option<String>>,
}

impl ConnectionController {
    pub fn new(bus: Arc<EventBus>, faults: Option<Arc<GlobalErrorHandler>>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            faults,
            connections: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashSet::new()),
            fast_path: Arc::new(RwLock::new(None)),
            transfers: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register the single fast-path sink. Raw received bytes from every
    /// worker arrive here as `(port_id, bytes, timestamp_ns)`.
    pub fn set_fast_path_sink(&self, sink: FastPathSink) {
        *self.fast_path.write() = Some(sink);
    }

    /// Open a connection using the transport selected by the port id.
    pub async fn open(self: &Arc<Self>, config: PortConfig) -> Result<(), OpenError> {
        let transport = TransportFactory::create(&config)?;
        self.open_with_transport(config, transport).await
    }

    /// Open a connection over a caller-supplied transport. Used by tests and
    /// by callers that pre-configure loopback endpoints.
    pub async fn open_with_transport(
        self: &Arc<Self>,
        config: PortConfig,
        mut transport: Box<dyn SerialTransport>,
    ) -> Result<(), OpenError> {
        config.validate().map_err(|err| {
            self.publish_open_failed(&config.port_id, &err);
            err
        })?;
        let port_id = config.port_id.clone();

        {
            let connections = self.connections.read();
            let mut opening = self.opening.lock();
            if connections.contains_key(&port_id) || opening.contains(&port_id) {
                let err = OpenError::Busy;
                drop(connections);
                drop(opening);
                self.publish_open_failed(&port_id, &err);
                return Err(err);
            }
            opening.insert(port_id.clone());
        }

        let opened = transport.open(&config).await;
        if let Err(err) = opened {
            self.opening.lock().remove(&port_id);
            self.publish_open_failed(&port_id, &err);
            return Err(err);
        }

        let tx = Arc::new(BoundedQueue::new(config.tx_queue_limit));
        let ring = Arc::new(RingBuffer::with_capacity(config.rx_ring_capacity));
        let stats = Arc::new(PortStats::new());
        let control = Arc::new(WorkerControl::new());
        let parser = make_parser(&port_id, &config.parser);

        let worker = ConnectionWorker::new(
            port_id.clone(),
            transport,
            parser,
            Arc::clone(&tx),
            Arc::clone(&ring),
            Arc::clone(&stats),
            Arc::clone(&control),
            Arc::clone(&self.bus),
            Arc::clone(&self.fast_path),
        );

        // The entry must be visible before the worker runs: a transport that
        // faults immediately reaches handle_worker_failure, which tears down
        // by registry key.
        let entry = ConnectionEntry {
            config: config.clone(),
            state: ConnectionState::Open,
            tx,
            ring,
            stats,
            control,
            join: None,
        };
        self.connections.write().insert(port_id.clone(), entry);
        self.opening.lock().remove(&port_id);

        let supervisor = Arc::clone(self);
        let failure_port = port_id.clone();
        let task = async move {
            if worker.run().await == WorkerExit::Failed {
                supervisor.handle_worker_failure(&failure_port).await;
            }
        };
        let join = match &self.faults {
            Some(faults) => faults.spawn_supervised(&format!("worker:{port_id}"), task),
            None => tokio::spawn(task),
        };
        if let Some(entry) = self.connections.write().get_mut(&port_id) {
            entry.join = Some(join);
        }

        info!(%port_id, "port opened");
        self.bus
            .publish_event(&Event::PortOpened { port_id, config });
        Ok(())
    }

    fn publish_open_failed(&self, port_id: &str, err: &OpenError) {
        self.bus.publish_event(&Event::PortOpenFailed {
            port_id: port_id.to_string(),
            error_kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    /// Close one connection. Any registered file transfer for the port is
    /// cancelled first so it can never touch a dead worker. Returns `false`
    /// when the port is unknown or already closing.
    pub async fn close(&self, port_id: &str, mode: CloseMode) -> bool {
        let (control, join) = {
            let mut connections = self.connections.write();
            let Some(entry) = connections.get_mut(port_id) else {
                return false;
            };
            if entry.state == ConnectionState::Closing {
                return false;
            }
            entry.state = ConnectionState::Closing;
            (Arc::clone(&entry.control), entry.join.take())
        };

        self.cancel_transfer_for(port_id);
        control.request_stop(mode);

        if let Some(mut join) = join {
            if timeout(CLOSE_TIMEOUT, &mut join).await.is_err() {
                warn!(port_id, "worker did not stop within {CLOSE_TIMEOUT:?}, aborting");
                join.abort();
            }
        }

        self.connections.write().remove(port_id);
        self.clear_current_if(port_id);
        info!(port_id, "port closed");
        self.bus.publish_event(&Event::PortClosed {
            port_id: port_id.to_string(),
        });
        true
    }

    /// Teardown after a worker published `port.error` and exited on its own.
    async fn handle_worker_failure(&self, port_id: &str) {
        self.cancel_transfer_for(port_id);
        let removed = {
            let mut connections = self.connections.write();
            if let Some(entry) = connections.get_mut(port_id) {
                entry.state = ConnectionState::Error;
            }
            connections.remove(port_id)
        };
        if removed.is_some() {
            self.clear_current_if(port_id);
            warn!(port_id, "connection torn down after worker fault");
            self.bus.publish_event(&Event::PortClosed {
                port_id: port_id.to_string(),
            });
        }
    }

    /// Enqueue bytes for transmission on one port. Queue-full is returned to
    /// the caller as backpressure, never absorbed.
    pub fn send(&self, port_id: &str, bytes: Bytes) -> Result<(), SendError> {
        let connections = self.connections.read();
        let entry = connections
            .get(port_id)
            .filter(|e| e.state == ConnectionState::Open)
            .ok_or_else(|| SendError::NotOpen(port_id.to_string()))?;
        if entry.tx.try_push(bytes) {
            Ok(())
        } else {
            Err(SendError::QueueFull(port_id.to_string()))
        }
    }

    /// Send to every open connection. Iterates a snapshot of the key set so
    /// a concurrent open/close cannot disturb the iteration; returns the
    /// per-port outcome in snapshot order.
    pub fn broadcast(&self, bytes: &Bytes) -> Vec<(String, bool)> {
        let ports = self.open_ports();
        ports
            .into_iter()
            .map(|port_id| {
                let ok = self.send(&port_id, bytes.clone()).is_ok();
                (port_id, ok)
            })
            .collect()
    }

    /// Snapshot of currently open port ids, sorted for deterministic
    /// broadcast order.
    pub fn open_ports(&self) -> Vec<String> {
        let connections = self.connections.read();
        let mut ports: Vec<String> = connections
            .iter()
            .filter(|(_, e)| e.state == ConnectionState::Open)
            .map(|(k, _)| k.clone())
            .collect();
        ports.sort();
        ports
    }

    pub fn state(&self, port_id: &str) -> ConnectionState {
        self.connections
            .read()
            .get(port_id)
            .map(|e| e.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_open(&self, port_id: &str) -> bool {
        self.state(port_id) == ConnectionState::Open
    }

    pub fn config(&self, port_id: &str) -> Option<PortConfig> {
        self.connections
            .read()
            .get(port_id)
            .map(|e| e.config.clone())
    }

    /// Designate the connection targeted by non-broadcast operations.
    pub fn set_current(&self, port_id: Option<String>) {
        *self.current.lock() = port_id;
    }

    pub fn current(&self) -> Option<String> {
        self.current.lock().clone()
    }

    fn clear_current_if(&self, port_id: &str) {
        let mut current = self.current.lock();
        if current.as_deref() == Some(port_id) {
            *current = None;
        }
    }

    /// Drain up to `max` bytes from the port's receive ring (inspector
    /// surface).
    pub fn read_rx_buffer(&self, port_id: &str, max: usize) -> Option<Vec<u8>> {
        self.connections
            .read()
            .get(port_id)
            .map(|e| e.ring.read_chunk(max))
    }

    pub fn stats(&self, port_id: &str) -> Option<PortStatsSnapshot> {
        self.connections
            .read()
            .get(port_id)
            .map(|e| e.stats.snapshot())
    }

    // --- file-transfer registry -------------------------------------------

    /// Register a transfer for its port. One job per port; the port must be
    /// open.
    pub fn register_transfer(
        &self,
        handle: Arc<TransferHandle>,
    ) -> Result<(), TransferError> {
        let port_id = handle.port_id().to_string();
        if !self.is_open(&port_id) {
            return Err(TransferError::PortNotOpen(port_id));
        }
        let mut transfers = self.transfers.lock();
        if transfers.contains_key(&port_id) {
            return Err(TransferError::TransferActive(port_id));
        }
        transfers.insert(port_id, handle);
        Ok(())
    }

    /// Remove the registration once a job ends, keyed by job id so a stale
    /// deregistration cannot evict a successor job.
    pub fn deregister_transfer(&self, port_id: &str, job_id: uuid::Uuid) {
        let mut transfers = self.transfers.lock();
        if transfers.get(port_id).map(|h| h.job_id()) == Some(job_id) {
            transfers.remove(port_id);
        }
    }

    /// Cancel and deregister the transfer bound to `port_id`, if any. Only
    /// this port's transfer is touched.
    fn cancel_transfer_for(&self, port_id: &str) {
        let handle = self.transfers.lock().remove(port_id);
        if let Some(handle) = handle {
            debug!(port_id, "cancelling transfer for closing port");
            handle.cancel();
        }
    }

    /// Close every connection in parallel, bounded by `grace`. Connections
    /// still alive when the bound expires are torn down forcibly.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        let ports = {
            let connections = self.connections.read();
            connections.keys().cloned().collect::<Vec<_>>()
        };
        if ports.is_empty() {
            return;
        }
        info!(count = ports.len(), "closing all connections");

        let mut closes = tokio::task::JoinSet::new();
        for port_id in ports {
            let controller = Arc::clone(self);
            closes.spawn(async move {
                controller.close(&port_id, CloseMode::Drain).await;
            });
        }
        let drain_all = async {
            while closes.join_next().await.is_some() {}
        };
        if timeout(grace, drain_all).await.is_err() {
            warn!("graceful shutdown expired, forcing remaining connections closed");
            let leftover: Vec<String> = self.connections.read().keys().cloned().collect();
            for port_id in leftover {
                self.cancel_transfer_for(&port_id);
                if let Some(entry) = self.connections.write().remove(&port_id) {
                    entry.control.request_stop(CloseMode::Force);
                    if let Some(join) = entry.join {
                        join.abort();
                    }
                    self.bus.publish_event(&Event::PortClosed { port_id });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loop_config(id: &str) -> PortConfig {
        let mut config = PortConfig::new(format!("loop://{id}"));
        config.read_timeout_ms = 5;
        config
    }

    #[tokio::test]
    async fn open_send_close_lifecycle() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(Arc::clone(&bus), None);

        let sent = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&sent);
        bus.subscribe("port.data_sent", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        controller.open(loop_config("a")).await.unwrap();
        assert!(controller.is_open("loop://a"));

        controller
            .send("loop://a", Bytes::from_static(b"AT\r\n"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        assert!(controller.close("loop://a", CloseMode::Drain).await);
        assert!(!controller.is_open("loop://a"));
        assert!(!controller.close("loop://a", CloseMode::Drain).await);
    }

    #[tokio::test]
    async fn double_open_is_busy() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(bus, None);
        controller.open(loop_config("dup")).await.unwrap();
        assert_eq!(
            controller.open(loop_config("dup")).await,
            Err(OpenError::Busy)
        );
        controller.close("loop://dup", CloseMode::Force).await;
    }

    #[tokio::test]
    async fn send_to_unknown_port_is_not_open() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(bus, None);
        assert!(matches!(
            controller.send("loop://ghost", Bytes::from_static(b"x")),
            Err(SendError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn queue_full_surfaces_to_caller() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(bus, None);
        let mut config = loop_config("full");
        config.tx_queue_limit = 1;
        // A write delay keeps the worker from draining between pushes.
        let transport = LoopbackTransport::new().with_write_delay(Duration::from_millis(200));
        controller
            .open_with_transport(config, Box::new(transport))
            .await
            .unwrap();

        // Fill the single slot, then the next push must fail.
        let mut full_seen = false;
        for _ in 0..8 {
            if matches!(
                controller.send("loop://full", Bytes::from_static(b"y")),
                Err(SendError::QueueFull(_))
            ) {
                full_seen = true;
                break;
            }
        }
        assert!(full_seen);
        controller.close("loop://full", CloseMode::Force).await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_open_port() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(bus, None);
        controller.open(loop_config("b1")).await.unwrap();
        controller.open(loop_config("b2")).await.unwrap();

        let outcome = controller.broadcast(&Bytes::from_static(b"X"));
        assert_eq!(outcome.len(), 2);
        assert!(outcome.iter().all(|(_, ok)| *ok));

        controller.shutdown(Duration::from_secs(2)).await;
        assert!(controller.open_ports().is_empty());
    }

    #[tokio::test]
    async fn worker_fault_tears_the_connection_down() {
        let bus = Arc::new(EventBus::new());
        let controller = ConnectionController::new(Arc::clone(&bus), None);

        let errors = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        bus.subscribe("port.error", move |_, _| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&closes);
        bus.subscribe("port.closed", move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let transport = LoopbackTransport::new();
        let handle = transport.handle();
        controller
            .open_with_transport(loop_config("fault"), Box::new(transport))
            .await
            .unwrap();

        handle.disconnect();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!controller.is_open("loop://fault"));
    }
}
