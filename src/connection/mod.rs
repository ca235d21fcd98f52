//! # Connection Fabric
//!
//! A connection is the runtime triple (config, transport, worker). The
//! [`ConnectionController`] owns the collection and is the single authority
//! for lifecycle transitions:
//!
//! ```text
//! Closed → Opening → Open → Closing → Closed
//!              ↘       ↓
//!                  Error → Closed
//! ```
//!
//! Exactly one worker task exists per `Open` connection. Workers deliver
//! received bytes on two channels: typed events on the bus (slow path) and
//! the controller's registered fast-path sink (raw bytes, no bus overhead).

use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub mod controller;
pub mod worker;

pub use controller::ConnectionController;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
    /// Transient: entered from `Opening` or `Open`, resolves to `Closed`.
    Error,
}

/// How pending transmit data is treated when a connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Flush the transmit queue before the worker exits.
    Drain,
    /// Discard the transmit queue and exit immediately.
    Force,
}

/// Fast-path sink: `(port_id, bytes, timestamp_ns)`. One sink is registered
/// process-wide; the controller forwards worker deliveries to it untouched.
pub type FastPathSink = Arc<dyn Fn(&str, Bytes, u64) + Send + Sync>;

pub(crate) type SharedFastPath = Arc<parking_lot::RwLock<Option<FastPathSink>>>;

const STOP_NONE: u8 = 0;
const STOP_DRAIN: u8 = 1;
const STOP_FORCE: u8 = 2;

/// Cooperative stop flag shared between controller and worker.
#[derive(Debug)]
pub(crate) struct WorkerControl {
    stop: AtomicU8,
}

impl WorkerControl {
    pub(crate) fn new() -> Self {
        Self {
            stop: AtomicU8::new(STOP_NONE),
        }
    }

    pub(crate) fn request_stop(&self, mode: CloseMode) {
        let value = match mode {
            CloseMode::Drain => STOP_DRAIN,
            CloseMode::Force => STOP_FORCE,
        };
        self.stop.store(value, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> Option<CloseMode> {
        match self.stop.load(Ordering::SeqCst) {
            STOP_DRAIN => Some(CloseMode::Drain),
            STOP_FORCE => Some(CloseMode::Force),
            _ => None,
        }
    }
}
