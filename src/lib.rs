//! # Serial Fabric
//!
//! Connection fabric and data pipeline for a multi-port serial communication
//! utility: transports, per-port I/O workers, bounded buffering, streaming
//! packet parsers, scripted macro execution with response matching,
//! backpressure-aware file streaming, and a dual-path event system (typed
//! bus for control events, direct fast path for raw bytes).

pub mod automation;
pub mod buffer;
pub mod bus;
pub mod cli;
pub mod command;
pub mod config;
pub mod connection;
pub mod data_logger;
pub mod dispatch;
pub mod error;
pub mod expect;
pub mod file_transfer;
pub mod metrics;
pub mod parser;
pub mod settings;
pub mod transport;
pub mod utils;

pub use automation::{MacroOptions, MacroRunner, MacroState, MacroStep};
pub use buffer::{BoundedQueue, RingBuffer};
pub use bus::{Event, EventBus, SubscriptionId};
pub use config::{Endpoint, ParserSelection, PortConfig};
pub use connection::{CloseMode, ConnectionController, ConnectionState, FastPathSink};
pub use data_logger::{DataLogger, DataLoggerConfig, LogFormat};
pub use dispatch::{UiBatch, UiDispatcher};
pub use error::{GlobalErrorHandler, OpenError, ReadError, SendError, WriteError};
pub use expect::ExpectMatcher;
pub use file_transfer::{FileTransferEngine, TransferHandle, TransferStatus};
pub use metrics::{PortStats, PortStatsSnapshot};
pub use parser::{Packet, PacketCategory, PacketParser};
pub use settings::{Settings, SettingsStore};
pub use transport::{LoopbackTransport, SerialTransport, TransportFactory};

/// The current version of serial-fabric
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default baud rate for newly opened ports
    pub const BAUD_RATE: u32 = 115_200;

    /// Default transport read timeout
    pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

    /// Default grace period for closing all connections at shutdown
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    /// Default expect timeout for macro steps
    pub const EXPECT_TIMEOUT: Duration = Duration::from_millis(1000);
}
