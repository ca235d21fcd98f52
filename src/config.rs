//! # Port Configuration
//!
//! Immutable description of one endpoint. A `PortConfig` is created from the
//! CLI or the settings store, validated once, and never mutated after being
//! bound to a worker; changing any field requires close → reopen.

use crate::buffer::{DEFAULT_RING_CAPACITY, DEFAULT_TX_QUEUE_LIMIT};
use crate::error::OpenError;
use serde::{Deserialize, Serialize};

/// Data bits per character frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    pub fn as_u8(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }

    pub fn from_u8(bits: u8) -> Option<Self> {
        match bits {
            5 => Some(DataBits::Five),
            6 => Some(DataBits::Six),
            7 => Some(DataBits::Seven),
            8 => Some(DataBits::Eight),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    RtsCts,
    XonXoff,
    DsrDtr,
}

/// Which packet parser a connection runs, with its options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParserSelection {
    Raw,
    At,
    /// Emit one block per occurrence of any configured delimiter.
    Delimiter { delimiters: Vec<Vec<u8>> },
    /// Emit blocks of exactly `length` bytes (1..=4096).
    FixedLength { length: usize },
    Hex,
}

impl Default for ParserSelection {
    fn default() -> Self {
        ParserSelection::Raw
    }
}

/// Where the byte stream actually lives.
///
/// The port identifier doubles as an endpoint address: `tcp://host:port`
/// selects a socket endpoint, `loop://name` the in-memory loopback, anything
/// else is treated as a serial device path (`/dev/ttyUSB0`, `COM3`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Serial { path: String },
    Tcp { host: String, port: u16 },
    Loopback,
}

impl Endpoint {
    pub fn parse(port_id: &str) -> Result<Self, OpenError> {
        if let Some(rest) = port_id.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                OpenError::InvalidParameters(format!("tcp endpoint without port: {port_id}"))
            })?;
            let port = port.parse::<u16>().map_err(|_| {
                OpenError::InvalidParameters(format!("bad tcp port in {port_id}"))
            })?;
            if host.is_empty() {
                return Err(OpenError::InvalidParameters(format!(
                    "tcp endpoint without host: {port_id}"
                )));
            }
            Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            })
        } else if port_id.starts_with("loop://") {
            Ok(Endpoint::Loopback)
        } else if port_id.is_empty() {
            Err(OpenError::InvalidParameters("empty port identifier".into()))
        } else {
            Ok(Endpoint::Serial {
                path: port_id.to_string(),
            })
        }
    }
}

/// Immutable description of one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Unique key within one controller; also the endpoint address.
    pub port_id: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Transport read timeout. Zero means "return immediately".
    pub read_timeout_ms: u64,
    pub parser: ParserSelection,
    /// Transmit queue depth in chunks.
    pub tx_queue_limit: usize,
    /// Receive ring capacity in bytes.
    pub rx_ring_capacity: usize,
}

impl PortConfig {
    /// A config with conventional 115200 8N1 framing for `port_id`.
    pub fn new(port_id: impl Into<String>) -> Self {
        Self {
            port_id: port_id.into(),
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            read_timeout_ms: 20,
            parser: ParserSelection::default(),
            tx_queue_limit: DEFAULT_TX_QUEUE_LIMIT,
            rx_ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint, OpenError> {
        Endpoint::parse(&self.port_id)
    }

    /// Validate every field the state machine depends on. Called by the
    /// controller before a transport is constructed.
    pub fn validate(&self) -> Result<(), OpenError> {
        self.endpoint()?;
        if self.baud_rate == 0 {
            return Err(OpenError::InvalidParameters("baud rate must be positive".into()));
        }
        if self.tx_queue_limit == 0 {
            return Err(OpenError::InvalidParameters(
                "tx queue limit must be non-zero".into(),
            ));
        }
        if self.rx_ring_capacity == 0 {
            return Err(OpenError::InvalidParameters(
                "rx ring capacity must be non-zero".into(),
            ));
        }
        match &self.parser {
            ParserSelection::FixedLength { length } => {
                if !(1..=4096).contains(length) {
                    return Err(OpenError::InvalidParameters(format!(
                        "fixed parser length {length} outside 1..=4096"
                    )));
                }
            }
            ParserSelection::Delimiter { delimiters } => {
                if delimiters.is_empty() || delimiters.iter().any(|d| d.is_empty()) {
                    return Err(OpenError::InvalidParameters(
                        "delimiter parser requires non-empty delimiters".into(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}
