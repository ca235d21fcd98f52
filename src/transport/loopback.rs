use super::SerialTransport;
use crate::config::PortConfig;
use crate::error::{OpenError, ReadError, WriteError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

/// A scripted reply: bytes that appear on the read side `delay` after a
/// write is observed.
#[derive(Clone)]
pub struct LoopbackReply {
    pub bytes: Vec<u8>,
    pub delay: Duration,
}

type Responder = Arc<dyn Fn(&[u8]) -> Option<LoopbackReply> + Send + Sync>;

struct LoopbackState {
    rx: Mutex<VecDeque<u8>>,
    notify: Notify,
    connected: AtomicBool,
}

impl LoopbackState {
    fn inject(&self, bytes: &[u8]) {
        self.rx.lock().extend(bytes.iter().copied());
        self.notify.notify_waiters();
    }
}

/// External handle onto a loopback endpoint: inject receive data or simulate
/// a pulled cable from outside the owning worker.
#[derive(Clone)]
pub struct LoopbackHandle {
    state: Arc<LoopbackState>,
}

impl LoopbackHandle {
    /// Make `bytes` available to the next `read`.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.inject(bytes);
    }

    /// Subsequent reads and writes fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }
}

/// In-memory endpoint used by tests and `loop://` port identifiers.
///
/// By default every write is echoed back to the read side. A responder
/// closure can replace the echo with scripted, optionally delayed replies,
/// and a write delay models a slow wire by stalling the writer — which is
/// exactly how transmit-queue backpressure is produced in tests.
pub struct LoopbackTransport {
    state: Arc<LoopbackState>,
    open: bool,
    echo: bool,
    responder: Option<Responder>,
    write_delay: Duration,
    read_timeout: Duration,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LoopbackState {
                rx: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                connected: AtomicBool::new(true),
            }),
            open: false,
            echo: true,
            responder: None,
            write_delay: Duration::ZERO,
            read_timeout: Duration::from_millis(20),
        }
    }

    /// Disable or enable the default write→read echo.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Script replies to observed writes. Implies no echo for writes the
    /// responder answers; return `None` to stay silent.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<LoopbackReply> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Stall every write by `delay`, modelling wire pacing.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Handle for injecting data or faults from outside the worker.
    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialTransport for LoopbackTransport {
    async fn open(&mut self, config: &PortConfig) -> Result<(), OpenError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(OpenError::Other("loopback disconnected".into()));
        }
        self.read_timeout = Duration::from_millis(config.read_timeout_ms);
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
    }

    async fn read(&mut self, max: usize) -> Result<Bytes, ReadError> {
        if !self.open {
            return Err(ReadError::Disconnected);
        }
        loop {
            if !self.state.connected.load(Ordering::SeqCst) {
                return Err(ReadError::Disconnected);
            }
            {
                let mut rx = self.state.rx.lock();
                if !rx.is_empty() {
                    let take = max.min(rx.len());
                    let out: Vec<u8> = rx.drain(..take).collect();
                    return Ok(Bytes::from(out));
                }
            }
            if self.read_timeout.is_zero() {
                return Ok(Bytes::new());
            }
            if timeout(self.read_timeout, self.state.notify.notified())
                .await
                .is_err()
            {
                return Ok(Bytes::new());
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        if !self.open || !self.state.connected.load(Ordering::SeqCst) {
            return Err(WriteError::Disconnected);
        }
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if let Some(responder) = &self.responder {
            if let Some(reply) = responder(bytes) {
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    if !reply.delay.is_zero() {
                        tokio::time::sleep(reply.delay).await;
                    }
                    state.inject(&reply.bytes);
                });
                return Ok(bytes.len());
            }
        }
        if self.echo {
            self.state.inject(bytes);
        }
        Ok(bytes.len())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PortConfig {
        let mut config = PortConfig::new("loop://t");
        config.read_timeout_ms = 50;
        config
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let mut transport = LoopbackTransport::new();
        transport.open(&config()).await.unwrap();
        assert_eq!(transport.write(b"AT\r\n").await.unwrap(), 4);
        assert_eq!(&transport.read(64).await.unwrap()[..], b"AT\r\n");
    }

    #[tokio::test]
    async fn timeout_returns_empty() {
        let mut transport = LoopbackTransport::new().with_echo(false);
        transport.open(&config()).await.unwrap();
        let got = transport.read(64).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn responder_replies_after_delay() {
        let mut transport = LoopbackTransport::new().with_responder(|written| {
            (written == b"AT\r\n").then(|| LoopbackReply {
                bytes: b"AT\r\nOK\r\n".to_vec(),
                delay: Duration::from_millis(30),
            })
        });
        transport.open(&config()).await.unwrap();
        transport.write(b"AT\r\n").await.unwrap();

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while collected.len() < 8 && tokio::time::Instant::now() < deadline {
            collected.extend_from_slice(&transport.read(64).await.unwrap());
        }
        assert_eq!(collected, b"AT\r\nOK\r\n");
    }

    #[tokio::test]
    async fn disconnect_fails_reads_and_writes() {
        let mut transport = LoopbackTransport::new();
        let handle = transport.handle();
        transport.open(&config()).await.unwrap();
        handle.disconnect();
        assert_eq!(transport.read(16).await, Err(ReadError::Disconnected));
        assert_eq!(transport.write(b"x").await, Err(WriteError::Disconnected));
    }

    #[tokio::test]
    async fn injected_bytes_are_readable() {
        let mut transport = LoopbackTransport::new().with_echo(false);
        let handle = transport.handle();
        transport.open(&config()).await.unwrap();
        handle.inject(b"+RING\r\n");
        assert_eq!(&transport.read(64).await.unwrap()[..], b"+RING\r\n");
    }
}
