//! # Event Bus (slow path)
//!
//! Topic-based publish/subscribe for typed control events: state changes,
//! errors, parsed packets, macro and transfer lifecycle, settings deltas.
//! This is deliberately NOT the per-byte hot path — raw received bytes travel
//! on the controller's fast-path sink and only coalesced batches appear here.
//!
//! ## Delivery contract
//!
//! - `publish` fans out synchronously in the caller's thread, in subscription
//!   registration order.
//! - Subscription patterns support shell-style wildcards (`*`, `?`); exact
//!   and wildcard subscriptions coexist and a payload is delivered once per
//!   matching subscription.
//! - A panicking handler is caught and logged; fan-out continues. Handlers
//!   that must cross threads hand off to the UI dispatcher or a channel —
//!   the bus never does that for them.
//! - Wildcard matching is O(subscriptions) per publish, acceptable off the
//!   hot data path.

use crate::automation::MacroStep;
use crate::config::PortConfig;
use crate::file_transfer::TransferStatus;
use crate::parser::Packet;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Topic names for every event the core publishes.
pub mod topics {
    pub const PORT_OPENED: &str = "port.opened";
    pub const PORT_CLOSED: &str = "port.closed";
    pub const PORT_ERROR: &str = "port.error";
    pub const PORT_OPEN_FAILED: &str = "port.open_failed";
    pub const PORT_PACKET: &str = "port.packet";
    pub const PORT_DATA_RECEIVED: &str = "port.data_received";
    pub const PORT_DATA_SENT: &str = "port.data_sent";
    pub const MACRO_STARTED: &str = "macro.started";
    pub const MACRO_STEP_STARTED: &str = "macro.step_started";
    pub const MACRO_STEP_COMPLETED: &str = "macro.step_completed";
    pub const MACRO_FINISHED: &str = "macro.finished";
    pub const FILE_PROGRESS: &str = "file.progress";
    pub const FILE_COMPLETED: &str = "file.completed";
    pub const FILE_ERROR: &str = "file.error";
    pub const FILE_CANCELLED: &str = "file.cancelled";
    pub const SETTINGS_CHANGED: &str = "settings.changed";
}

/// Typed payloads for every topic in [`topics`].
#[derive(Debug, Clone)]
pub enum Event {
    PortOpened {
        port_id: String,
        config: PortConfig,
    },
    PortClosed {
        port_id: String,
    },
    PortError {
        port_id: String,
        error_kind: String,
        message: String,
    },
    PortOpenFailed {
        port_id: String,
        error_kind: String,
        message: String,
    },
    Packet(Packet),
    DataReceived {
        port_id: String,
        timestamp_ns: u64,
        bytes: Bytes,
    },
    DataSent {
        port_id: String,
        timestamp_ns: u64,
        bytes: Bytes,
    },
    MacroStarted {
        script_id: Uuid,
    },
    MacroStepStarted {
        row_index: usize,
        step: MacroStep,
    },
    MacroStepCompleted {
        row_index: usize,
        success: bool,
        response_text: String,
    },
    MacroFinished {
        success: bool,
    },
    FileProgress {
        port_id: String,
        total_bytes: u64,
        sent_bytes: u64,
        throughput_bps: f64,
        eta_seconds: f64,
        status: TransferStatus,
    },
    FileCompleted {
        port_id: String,
        success: bool,
        message: String,
    },
    FileError {
        port_id: String,
        error_kind: String,
        message: String,
    },
    FileCancelled {
        port_id: String,
    },
    SettingsChanged {
        delta: HashMap<String, serde_json::Value>,
    },
}

impl Event {
    /// Canonical topic for this payload.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::PortOpened { .. } => topics::PORT_OPENED,
            Event::PortClosed { .. } => topics::PORT_CLOSED,
            Event::PortError { .. } => topics::PORT_ERROR,
            Event::PortOpenFailed { .. } => topics::PORT_OPEN_FAILED,
            Event::Packet(_) => topics::PORT_PACKET,
            Event::DataReceived { .. } => topics::PORT_DATA_RECEIVED,
            Event::DataSent { .. } => topics::PORT_DATA_SENT,
            Event::MacroStarted { .. } => topics::MACRO_STARTED,
            Event::MacroStepStarted { .. } => topics::MACRO_STEP_STARTED,
            Event::MacroStepCompleted { .. } => topics::MACRO_STEP_COMPLETED,
            Event::MacroFinished { .. } => topics::MACRO_FINISHED,
            Event::FileProgress { .. } => topics::FILE_PROGRESS,
            Event::FileCompleted { .. } => topics::FILE_COMPLETED,
            Event::FileError { .. } => topics::FILE_ERROR,
            Event::FileCancelled { .. } => topics::FILE_CANCELLED,
            Event::SettingsChanged { .. } => topics::SETTINGS_CHANGED,
        }
    }

    /// One-line payload summary for the debug trace.
    fn summary(&self) -> String {
        match self {
            Event::PortOpened { port_id, config } => {
                format!("{port_id} @ {}", config.baud_rate)
            }
            Event::PortClosed { port_id } => port_id.clone(),
            Event::PortError {
                port_id, error_kind, ..
            }
            | Event::PortOpenFailed {
                port_id, error_kind, ..
            } => format!("{port_id}: {error_kind}"),
            Event::Packet(packet) => {
                format!("{} {:?} {}B", packet.port_id, packet.category, packet.bytes.len())
            }
            Event::DataReceived { port_id, bytes, .. } => {
                format!("{port_id} rx {}B", bytes.len())
            }
            Event::DataSent { port_id, bytes, .. } => {
                format!("{port_id} tx {}B", bytes.len())
            }
            Event::MacroStarted { script_id } => script_id.to_string(),
            Event::MacroStepStarted { row_index, .. } => format!("row {row_index}"),
            Event::MacroStepCompleted {
                row_index, success, ..
            } => format!("row {row_index} success={success}"),
            Event::MacroFinished { success } => format!("success={success}"),
            Event::FileProgress {
                port_id, sent_bytes, ..
            } => format!("{port_id} sent {sent_bytes}B"),
            Event::FileCompleted {
                port_id, success, ..
            } => format!("{port_id} success={success}"),
            Event::FileError {
                port_id, error_kind, ..
            } => format!("{port_id}: {error_kind}"),
            Event::FileCancelled { port_id } => port_id.clone(),
            Event::SettingsChanged { delta } => format!("{} keys", delta.len()),
        }
    }
}

/// Identifier returned from [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&str, &Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Handler,
}

/// Topic-based pub/sub bus. See module docs for the delivery contract.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    debug_trace: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            debug_trace: AtomicBool::new(false),
        }
    }

    /// Register `handler` for every topic matching `pattern`. Patterns may
    /// contain `*` (any sequence) and `?` (any single character); a pattern
    /// without wildcards is an exact topic.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().retain(|s| s.id != id);
    }

    /// When enabled, every publish writes a structured debug line.
    pub fn set_debug_trace(&self, enabled: bool) {
        self.debug_trace.store(enabled, Ordering::Relaxed);
    }

    /// Synchronous fan-out of `event` to all subscriptions matching `topic`,
    /// in registration order. Handler panics are isolated.
    pub fn publish(&self, topic: &str, event: &Event) {
        if self.debug_trace.load(Ordering::Relaxed) {
            debug!(topic, payload = %event.summary(), "bus publish");
        }

        // Collect matching handlers first so a handler that subscribes or
        // unsubscribes does not deadlock against the read lock.
        let matched: Vec<Handler> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|s| topic_matches(&s.pattern, topic))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in matched {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(topic, event))) {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(topic, "event handler panicked: {what}");
            }
        }
    }

    /// Publish `event` on its canonical topic.
    pub fn publish_event(&self, event: &Event) {
        self.publish(event.topic(), event);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shell-style wildcard match: `*` matches any (possibly empty) sequence,
/// `?` exactly one character. Matching is on Unicode scalar values.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = topic.chars().collect();

    // Iterative glob with single-star backtracking.
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
