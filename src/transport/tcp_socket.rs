use super::SerialTransport;
use crate::config::{Endpoint, PortConfig};
use crate::error::{OpenError, ReadError, WriteError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Socket endpoint transport for `tcp://host:port` port identifiers, used
/// for serial-over-ethernet bridges. The connected socket gets NODELAY and
/// keepalive so small command/response exchanges are not coalesced away.
pub struct TcpSocketTransport {
    stream: Option<TcpStream>,
    read_timeout: Duration,
}

impl TcpSocketTransport {
    pub fn new() -> Self {
        Self {
            stream: None,
            read_timeout: Duration::from_millis(20),
        }
    }
}

impl Default for TcpSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn map_open_error(err: std::io::Error) -> OpenError {
    match err.kind() {
        ErrorKind::PermissionDenied => OpenError::PermissionDenied,
        ErrorKind::NotFound | ErrorKind::AddrNotAvailable => OpenError::NotFound,
        ErrorKind::AddrInUse => OpenError::Busy,
        _ => OpenError::Other(err.to_string()),
    }
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

#[async_trait]
impl SerialTransport for TcpSocketTransport {
    async fn open(&mut self, config: &PortConfig) -> Result<(), OpenError> {
        let Endpoint::Tcp { host, port } = config.endpoint()? else {
            return Err(OpenError::InvalidParameters(
                "tcp transport requires a tcp:// endpoint".into(),
            ));
        };
        let addr = format!("{host}:{port}");
        debug!(%addr, "connecting tcp endpoint");

        let stream = TcpStream::connect(&addr).await.map_err(map_open_error)?;

        // Configure socket options for low latency on the command path.
        let std_stream = stream
            .into_std()
            .map_err(|e| OpenError::Other(e.to_string()))?;
        let socket = socket2::SockRef::from(&std_stream);
        socket
            .set_nodelay(true)
            .map_err(|e| OpenError::Other(e.to_string()))?;
        socket
            .set_keepalive(true)
            .map_err(|e| OpenError::Other(e.to_string()))?;
        let stream =
            TcpStream::from_std(std_stream).map_err(|e| OpenError::Other(e.to_string()))?;

        debug!(%addr, "tcp endpoint connected");
        self.read_timeout = Duration::from_millis(config.read_timeout_ms);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("tcp endpoint closed");
        }
    }

    async fn read(&mut self, max: usize) -> Result<Bytes, ReadError> {
        let stream = self.stream.as_mut().ok_or(ReadError::Disconnected)?;
        let mut buf = vec![0u8; max];
        match timeout(self.read_timeout, stream.read(&mut buf)).await {
            Err(_elapsed) => Ok(Bytes::new()),
            // EOF: the peer closed the bridge.
            Ok(Ok(0)) => Err(ReadError::Disconnected),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Ok(Err(err)) if is_disconnect(err.kind()) => Err(ReadError::Disconnected),
            Ok(Err(err)) => Err(ReadError::Io(err.to_string())),
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        let stream = self.stream.as_mut().ok_or(WriteError::Disconnected)?;
        match stream.write(bytes).await {
            Ok(n) => Ok(n),
            Err(err) if is_disconnect(err.kind()) => Err(WriteError::Disconnected),
            Err(err) => Err(WriteError::Io(err.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trip_through_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = peer.read(&mut buf).await.unwrap();
            peer.write_all(&buf[..n]).await.unwrap();
        });

        let mut config = PortConfig::new(format!("tcp://127.0.0.1:{}", addr.port()));
        config.read_timeout_ms = 500;
        let mut transport = TcpSocketTransport::new();
        transport.open(&config).await.unwrap();
        assert_eq!(transport.write(b"ping").await.unwrap(), 4);
        let got = transport.read(16).await.unwrap();
        assert_eq!(&got[..], b"ping");
        echo.await.unwrap();
        transport.close().await;
        transport.close().await; // idempotent
    }

    #[tokio::test]
    async fn refused_connection_is_a_typed_open_error() {
        // Port 1 is essentially never listening on loopback.
        let config = PortConfig::new("tcp://127.0.0.1:1");
        let mut transport = TcpSocketTransport::new();
        assert!(transport.open(&config).await.is_err());
    }

    #[tokio::test]
    async fn read_timeout_is_an_empty_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let keep_open = tokio::spawn(async move {
            let (_peer, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut config = PortConfig::new(format!("tcp://127.0.0.1:{}", addr.port()));
        config.read_timeout_ms = 10;
        let mut transport = TcpSocketTransport::new();
        transport.open(&config).await.unwrap();
        let got = transport.read(16).await.unwrap();
        assert!(got.is_empty());
        keep_open.abort();
    }
}
