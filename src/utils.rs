//! Small helpers shared across the crate: timestamps, human-readable
//! formatting, and the 16-byte hex/ASCII window used by the hex parser and
//! the hex-dump data log format.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp as nanoseconds since Unix epoch
///
/// If the system time is before the Unix epoch (very rare), returns 0
/// to provide a safe fallback rather than panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Format a byte count as a human-readable string (e.g. "1.5 KiB").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Format a throughput value as a human-readable rate (e.g. "2.0 MiB/s").
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

/// Render one 16-byte window as `offset  hex columns  |ascii sidecar|`.
///
/// The hex column is padded to a full 16-byte width so consecutive lines
/// align regardless of the final window's length.
pub fn hex_ascii_line(offset: usize, window: &[u8]) -> String {
    debug_assert!(window.len() <= 16);
    let mut line = String::with_capacity(76);
    let _ = write!(line, "{:08x}  ", offset);
    for i in 0..16 {
        match window.get(i) {
            Some(b) => {
                let _ = write!(line, "{:02x} ", b);
            }
            None => line.push_str("   "),
        }
        if i == 7 {
            line.push(' ');
        }
    }
    line.push_str(" |");
    for b in window {
        line.push(if b.is_ascii_graphic() || *b == b' ' {
            *b as char
        } else {
            '.'
        });
    }
    line.push('|');
    line
}
