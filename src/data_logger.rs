//! # Data Logger
//!
//! Persists the TX/RX byte streams from the bus in one of three formats:
//!
//! - **Raw** — received bytes (and optionally transmitted) concatenated with
//!   no framing.
//! - **HexDump** — one line per 16-byte window with offset, hex columns, and
//!   ASCII sidecar; an `RX `/`TX ` prefix distinguishes direction.
//! - **PCAP** — a valid capture file with per-record timestamps. Link type
//!   is DLT_NULL (0): each record carries a 4-byte family word used here to
//!   encode direction (0 = RX, 1 = TX), so a reader can demultiplex the two
//!   streams.
//!
//! ## Rotation
//!
//! Capture files are size-bound. When the active file would exceed
//! `max_file_bytes` it is gzip-compressed to `<name>.<index>.gz` and a fresh
//! file is started; only the newest `keep_files` archives are retained, the
//! oldest deleted first.

use crate::bus::{Event, EventBus, SubscriptionId};
use crate::utils::hex_ascii_line;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// On-disk format for captured traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Raw,
    HexDump,
    Pcap,
}

impl LogFormat {
    fn extension(self) -> &'static str {
        match self {
            LogFormat::Raw => "bin",
            LogFormat::HexDump => "log",
            LogFormat::Pcap => "pcap",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataLoggerConfig {
    pub dir: PathBuf,
    pub format: LogFormat,
    pub max_file_bytes: u64,
    pub keep_files: usize,
    /// Capture the transmit direction too (full-duplex recording).
    pub include_tx: bool,
}

impl Default for DataLoggerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            format: LogFormat::Raw,
            max_file_bytes: 10 * 1024 * 1024,
            keep_files: 5,
            include_tx: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Rx,
    Tx,
}

struct LoggerInner {
    config: DataLoggerConfig,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
    /// Per-direction running offsets for the hex dump format.
    rx_offset: usize,
    tx_offset: usize,
}

/// Bus-fed capture sink. Dropping the logger unsubscribes and flushes.
pub struct DataLogger {
    bus: Arc<EventBus>,
    subscription: SubscriptionId,
    inner: Arc<Mutex<LoggerInner>>,
}

impl DataLogger {
    /// Create the capture file and subscribe to the data topics.
    pub fn start(bus: Arc<EventBus>, config: DataLoggerConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = config
            .dir
            .join(format!("capture-{stamp}.{}", config.format.extension()));

        let mut inner = LoggerInner {
            config,
            path,
            writer: None,
            written: 0,
            rx_offset: 0,
            tx_offset: 0,
        };
        inner.open_fresh()?;
        debug!(path = %inner.path.display(), "data logger started");

        let inner = Arc::new(Mutex::new(inner));
        let sink = Arc::clone(&inner);
        let subscription = bus.subscribe("port.data_*", move |_, event| {
            let (direction, timestamp_ns, bytes) = match event {
                Event::DataReceived {
                    timestamp_ns, bytes, ..
                } => (Direction::Rx, *timestamp_ns, bytes),
                Event::DataSent {
                    timestamp_ns, bytes, ..
                } => (Direction::Tx, *timestamp_ns, bytes),
                _ => return,
            };
            let mut inner = sink.lock();
            if direction == Direction::Tx && !inner.config.include_tx {
                return;
            }
            if let Err(err) = inner.record(direction, timestamp_ns, bytes) {
                warn!("data logger write failed: {err}");
            }
        });

        Ok(Self {
            bus,
            subscription,
            inner,
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn current_path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }
}

impl Drop for DataLogger {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl LoggerInner {
    fn open_fresh(&mut self) -> io::Result<()> {
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        self.written = 0;
        if self.config.format == LogFormat::Pcap {
            self.written += write_pcap_global_header(&mut writer)? as u64;
        }
        self.writer = Some(writer);
        Ok(())
    }

    fn record(&mut self, direction: Direction, timestamp_ns: u64, bytes: &[u8]) -> io::Result<()> {
        let encoded = self.encode(direction, timestamp_ns, bytes);
        if self.written + encoded.len() as u64 > self.config.max_file_bytes && self.written > 0 {
            self.rotate()?;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "logger closed"))?;
        writer.write_all(&encoded)?;
        self.written += encoded.len() as u64;
        Ok(())
    }

    fn encode(&mut self, direction: Direction, timestamp_ns: u64, bytes: &[u8]) -> Vec<u8> {
        match self.config.format {
            LogFormat::Raw => bytes.to_vec(),
            LogFormat::HexDump => {
                let (label, offset) = match direction {
                    Direction::Rx => ("RX", &mut self.rx_offset),
                    Direction::Tx => ("TX", &mut self.tx_offset),
                };
                let mut out = String::new();
                for window in bytes.chunks(16) {
                    out.push_str(label);
                    out.push(' ');
                    out.push_str(&hex_ascii_line(*offset, window));
                    out.push('\n');
                    *offset += window.len();
                }
                out.into_bytes()
            }
            LogFormat::Pcap => encode_pcap_record(direction, timestamp_ns, bytes),
        }
    }

    /// Compress the active file to `<name>.<index>.gz`, prune old archives,
    /// and start a fresh file.
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }

        let next_index = self.archives()?.last().map(|(i, _)| i + 1).unwrap_or(1);
        let archive = self
            .path
            .with_extension(format!("{}.{next_index}.gz", extension_of(&self.path)));
        gzip_file(&self.path, &archive)?;
        fs::remove_file(&self.path)?;
        debug!(archive = %archive.display(), "capture file rotated");

        let archives = self.archives()?;
        if archives.len() > self.config.keep_files {
            for (_, stale) in &archives[..archives.len() - self.config.keep_files] {
                let _ = fs::remove_file(stale);
            }
        }

        self.open_fresh()
    }

    /// Existing rotation archives, oldest first.
    fn archives(&self) -> io::Result<Vec<(u64, PathBuf)>> {
        let stem = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(tail) = name
                .strip_prefix(&stem)
                .and_then(|t| t.strip_prefix('.'))
                .and_then(|t| t.strip_suffix(".gz"))
            else {
                continue;
            };
            if let Ok(index) = tail.parse::<u64>() {
                found.push((index, entry.path()));
            }
        }
        found.sort();
        Ok(found)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_string()
}

fn gzip_file(source: &Path, target: &Path) -> io::Result<()> {
    let data = fs::read(source)?;
    let file = File::create(target)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?.sync_all()
}

/// Standard pcap global header: magic, version 2.4, snaplen 64 KiB, link
/// type DLT_NULL.
fn write_pcap_global_header(writer: &mut impl Write) -> io::Result<usize> {
    let mut header = Vec::with_capacity(24);
    header.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    header.extend_from_slice(&2u16.to_le_bytes());
    header.extend_from_slice(&4u16.to_le_bytes());
    header.extend_from_slice(&0i32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&65_535u32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    writer.write_all(&header)?;
    Ok(header.len())
}

fn encode_pcap_record(direction: Direction, timestamp_ns: u64, bytes: &[u8]) -> Vec<u8> {
    let family: u32 = match direction {
        Direction::Rx => 0,
        Direction::Tx => 1,
    };
    let captured = bytes.len() as u32 + 4;
    let mut record = Vec::with_capacity(20 + bytes.len());
    record.extend_from_slice(&((timestamp_ns / 1_000_000_000) as u32).to_le_bytes());
    record.extend_from_slice(&(((timestamp_ns % 1_000_000_000) / 1_000) as u32).to_le_bytes());
    record.extend_from_slice(&captured.to_le_bytes());
    record.extend_from_slice(&captured.to_le_bytes());
    record.extend_from_slice(&family.to_le_bytes());
    record.extend_from_slice(bytes);
    record
}
