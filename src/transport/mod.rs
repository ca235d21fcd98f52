//! # Transport Abstraction and Implementations
//!
//! A transport owns the byte stream for one endpoint: open it with a
//! [`PortConfig`](crate::config::PortConfig), move bytes in and out, close
//! it. Everything above this trait (workers, controller, macros, transfers)
//! is endpoint-agnostic; everything below it is one concrete wire.
//!
//! ## Contract
//!
//! - `open` reports failure through typed [`OpenError`] variants so the
//!   controller can distinguish a busy port from a missing one.
//! - `close` is idempotent.
//! - `read` returns an empty buffer on timeout — a timeout is not an error.
//!   `Disconnected` is reserved for a gone peer or unplugged device.
//! - `write` may be partial; the caller retries the remainder. Failures
//!   propagate; silent swallowing is forbidden.
//!
//! A transport instance is driven by exactly one worker task; it does not
//! synchronize internally.
//!
//! ## Implementations
//!
//! - [`SerialPortTransport`] — real serial devices via `serial2-tokio`.
//! - [`TcpSocketTransport`] — `tcp://host:port` endpoints with NODELAY and
//!   keepalive applied through `socket2`.
//! - [`LoopbackTransport`] — in-memory endpoint with configurable echo,
//!   scripted responses, and fault injection; used by tests and `loop://`
//!   endpoints.

use crate::config::{Endpoint, PortConfig};
use crate::error::{OpenError, ReadError, WriteError};
use async_trait::async_trait;
use bytes::Bytes;

mod loopback;
mod serial_port;
mod tcp_socket;

pub use loopback::{LoopbackHandle, LoopbackReply, LoopbackTransport};
pub use serial_port::SerialPortTransport;
pub use tcp_socket::TcpSocketTransport;

/// Byte-stream transport for one endpoint. See module docs for the contract.
#[async_trait]
pub trait SerialTransport: Send {
    async fn open(&mut self, config: &PortConfig) -> Result<(), OpenError>;

    /// Idempotent; a closed transport stays closed.
    async fn close(&mut self);

    /// Read up to `max` bytes. Empty result means the read timed out.
    async fn read(&mut self, max: usize) -> Result<Bytes, ReadError>;

    /// Write as much of `bytes` as the endpoint accepts, returning the count.
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError>;

    fn name(&self) -> &'static str;
}

/// Creates transport instances from the endpoint encoded in the port id.
pub struct TransportFactory;

impl TransportFactory {
    pub fn create(config: &PortConfig) -> Result<Box<dyn SerialTransport>, OpenError> {
        match config.endpoint()? {
            Endpoint::Serial { .. } => Ok(Box::new(SerialPortTransport::new())),
            Endpoint::Tcp { .. } => Ok(Box::new(TcpSocketTransport::new())),
            Endpoint::Loopback => Ok(Box::new(LoopbackTransport::new())),
        }
    }
}
