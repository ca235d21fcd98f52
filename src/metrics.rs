//! # Per-Port Traffic Metrics
//!
//! This module provides the traffic counters and throughput analysis shared
//! by connection workers and the file-transfer engine. Counters are plain
//! atomics so the hot receive path never takes a lock; the sliding-window
//! throughput estimate is sampled under a short-held mutex because it is only
//! touched once per read batch.
//!
//! ## Measurement Model
//!
//! - **Counters**: monotonic RX/TX byte and packet totals plus the ring
//!   buffer's drop counter, readable at any time for telemetry.
//! - **Throughput**: bytes per second averaged over a sliding window
//!   (default 10 s), so short bursts and idle gaps both show up honestly
//!   rather than being flattened by a whole-session average.
//!
//! Snapshots are serializable records suitable for status output, in the
//! same spirit as a results file: a consumer should never need to reach into
//! live atomics.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default averaging window for throughput estimates.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Sliding-window throughput estimator.
///
/// Records `(instant, byte_count)` samples and reports the byte rate over
/// the configured trailing window. Samples older than the window are evicted
/// on every record and query, so memory stays bounded by the event rate
/// within one window.
#[derive(Debug)]
pub struct ThroughputWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total_in_window: u64,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total_in_window: 0,
        }
    }

    /// Record `bytes` transferred at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.total_in_window += bytes;
        self.evict(now);
    }

    /// Current byte rate over the trailing window.
    ///
    /// Divides by the elapsed span of retained samples (capped at the window
    /// length) so a 2-second burst is not diluted across a 10-second window.
    pub fn bytes_per_second(&mut self, now: Instant) -> f64 {
        self.evict(now);
        let Some(&(oldest, _)) = self.samples.front() else {
            return 0.0;
        };
        let span = now.duration_since(oldest).min(self.window);
        let secs = span.as_secs_f64();
        if secs <= f64::EPSILON {
            // All samples landed in the same instant; treat the window as
            // one millisecond to avoid reporting infinity.
            return self.total_in_window as f64 * 1000.0;
        }
        self.total_in_window as f64 / secs
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, n)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
                self.total_in_window -= n;
            } else {
                break;
            }
        }
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Live traffic counters for one connection.
///
/// Shared between the connection worker (writer) and any telemetry reader.
#[derive(Debug)]
pub struct PortStats {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    ring_dropped: AtomicU64,
    rx_window: Mutex<ThroughputWindow>,
}

impl PortStats {
    pub fn new() -> Self {
        Self {
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            ring_dropped: AtomicU64::new(0),
            rx_window: Mutex::new(ThroughputWindow::default()),
        }
    }

    pub fn add_rx(&self, bytes: u64) {
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.rx_window.lock().record(Instant::now(), bytes);
    }

    pub fn add_tx(&self, bytes: u64) {
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_packets(&self, count: u64) {
        self.rx_packets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_ring_dropped(&self, bytes: u64) {
        self.ring_dropped.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters plus the windowed RX rate.
    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            ring_dropped: self.ring_dropped.load(Ordering::Relaxed),
            rx_bytes_per_second: self.rx_window.lock().bytes_per_second(Instant::now()),
            captured_at: chrono::Utc::now(),
        }
    }
}

impl Default for PortStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable counter snapshot for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortStatsSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub ring_dropped: u64,
    pub rx_bytes_per_second: f64,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reports_rate_over_trailing_span() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(10));
        window.record(start, 1000);
        window.record(start + Duration::from_secs(1), 1000);
        let rate = window.bytes_per_second(start + Duration::from_secs(2));
        // 2000 bytes over a 2 second span.
        assert!((rate - 1000.0).abs() < 1.0, "rate was {rate}");
    }

    #[test]
    fn window_evicts_stale_samples() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(10));
        window.record(start, 1_000_000);
        // Far outside the window: the old burst must no longer count.
        let rate = window.bytes_per_second(start + Duration::from_secs(60));
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn stats_snapshot_reflects_counters() {
        let stats = PortStats::new();
        stats.add_rx(100);
        stats.add_tx(40);
        stats.add_packets(3);
        stats.add_ring_dropped(8);
        let snap = stats.snapshot();
        assert_eq!(snap.rx_bytes, 100);
        assert_eq!(snap.tx_bytes, 40);
        assert_eq!(snap.rx_packets, 3);
        assert_eq!(snap.ring_dropped, 8);
    }
}
