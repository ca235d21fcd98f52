use super::SerialTransport;
use crate::config::{DataBits, Endpoint, FlowControl, Parity, PortConfig, StopBits};
use crate::error::{OpenError, ReadError, WriteError};
use async_trait::async_trait;
use bytes::Bytes;
use serial2_tokio::SerialPort;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Real serial device transport backed by `serial2-tokio`.
///
/// Frame parameters come from the [`PortConfig`]; combinations the driver
/// layer cannot express (Mark/Space parity, 1.5 stop bits, DSR/DTR flow
/// control) are rejected at open time with `InvalidParameters` rather than
/// silently downgraded.
pub struct SerialPortTransport {
    port: Option<SerialPort>,
    read_timeout: Duration,
}

impl SerialPortTransport {
    pub fn new() -> Self {
        Self {
            port: None,
            read_timeout: Duration::from_millis(20),
        }
    }
}

impl Default for SerialPortTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn map_open_error(err: std::io::Error) -> OpenError {
    match err.kind() {
        ErrorKind::PermissionDenied => OpenError::PermissionDenied,
        ErrorKind::NotFound => OpenError::NotFound,
        // EBUSY surfaces as an uncategorized error; match the raw errno.
        _ if err.raw_os_error() == Some(16) => OpenError::Busy,
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
impl SerialTransport for SerialPortTransport {
    async fn open(&mut self, config: &PortConfig) -> Result<(), OpenError> {
        let Endpoint::Serial { path } = config.endpoint()? else {
            return Err(OpenError::InvalidParameters(
                "serial transport requires a device path".into(),
            ));
        };

        let char_size = match config.data_bits {
            DataBits::Five => serial2_tokio::CharSize::Bits5,
            DataBits::Six => serial2_tokio::CharSize::Bits6,
            DataBits::Seven => serial2_tokio::CharSize::Bits7,
            DataBits::Eight => serial2_tokio::CharSize::Bits8,
        };
        let parity = match config.parity {
            Parity::None => serial2_tokio::Parity::None,
            Parity::Even => serial2_tokio::Parity::Even,
            Parity::Odd => serial2_tokio::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(OpenError::InvalidParameters(
                    "mark/space parity is not supported on this platform".into(),
                ));
            }
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => serial2_tokio::StopBits::One,
            StopBits::Two => serial2_tokio::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(OpenError::InvalidParameters(
                    "1.5 stop bits is not supported on this platform".into(),
                ));
            }
        };
        let flow_control = match config.flow_control {
            FlowControl::None => serial2_tokio::FlowControl::None,
            FlowControl::RtsCts => serial2_tokio::FlowControl::RtsCts,
            FlowControl::XonXoff => serial2_tokio::FlowControl::XonXoff,
            FlowControl::DsrDtr => {
                return Err(OpenError::InvalidParameters(
                    "DSR/DTR flow control is not supported on this platform".into(),
                ));
            }
        };

        let baud = config.baud_rate;
        let port = SerialPort::open(&path, move |mut settings: serial2_tokio::Settings| {
            settings.set_raw();
            settings.set_baud_rate(baud)?;
            settings.set_char_size(char_size);
            settings.set_parity(parity);
            settings.set_stop_bits(stop_bits);
            settings.set_flow_control(flow_control);
            Ok(settings)
        })
        .map_err(map_open_error)?;

        debug!(%path, baud, "serial port opened");
        self.read_timeout = Duration::from_millis(config.read_timeout_ms);
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(port) = self.port.take() {
            drop(port);
            debug!("serial port closed");
        }
    }

    async fn read(&mut self, max: usize) -> Result<Bytes, ReadError> {
        let port = self.port.as_mut().ok_or(ReadError::Disconnected)?;
        let mut buf = vec![0u8; max];
        match timeout(self.read_timeout, port.read(&mut buf)).await {
            Err(_elapsed) => Ok(Bytes::new()),
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
        let port = self.port.as_mut().ok_or(WriteError::Disconnected)?;
        match port.write(bytes).await {
            Ok(n) => Ok(n),
            Err(err) if is_disconnect(err.kind()) => Err(WriteError::Disconnected),
            Err(err) => Err(WriteError::Io(err.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsupported_framing_is_rejected_at_open() {
        let mut config = PortConfig::new("/dev/null");
        config.parity = Parity::Mark;
        let mut transport = SerialPortTransport::new();
        assert!(matches!(
            transport.open(&config).await,
            Err(OpenError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn missing_device_maps_to_not_found() {
        let config = PortConfig::new("/dev/serial-fabric-does-not-exist");
        let mut transport = SerialPortTransport::new();
        assert_eq!(transport.open(&config).await, Err(OpenError::NotFound));
    }

    #[tokio::test]
    async fn io_after_close_reports_disconnected() {
        let mut transport = SerialPortTransport::new();
        transport.close().await;
        assert_eq!(transport.read(16).await, Err(ReadError::Disconnected));
        assert_eq!(transport.write(b"x").await, Err(WriteError::Disconnected));
    }
}
