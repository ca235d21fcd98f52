//! # Error Taxonomy and Fault Handling
//!
//! Typed errors for every fallible seam in the pipeline, plus the global
//! fault handler of last resort.
//!
//! ## Propagation policy
//!
//! - Function-call failures return these typed results.
//! - I/O failures inside workers surface as bus events; the worker catches,
//!   publishes, and terminates its loop rather than letting a failure escape.
//! - Programming bugs (invariant violations, task panics) are captured by
//!   [`GlobalErrorHandler`] and routed to a single sink: the tracing log plus
//!   an optional user-visible notification channel. A fault isolated to one
//!   component must not take the process down — a worker fault closes that
//!   connection, a macro fault stops the macro, a transfer fault fails that
//!   job.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// Failure to acquire a port.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("port is busy")]
    Busy,
    #[error("port not found")]
    NotFound,
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("{0}")]
    Other(String),
}

impl OpenError {
    /// Short machine-readable kind for event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            OpenError::PermissionDenied => "permission_denied",
            OpenError::Busy => "busy",
            OpenError::NotFound => "not_found",
            OpenError::InvalidParameters(_) => "invalid_parameters",
            OpenError::Other(_) => "other",
        }
    }
}

/// Failure while reading from a transport. A timeout is not an error; it is
/// an empty read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("read failed: {0}")]
    Io(String),
}

/// Failure while writing to a transport. Partial writes are not errors;
/// callers retry the remainder.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("write failed: {0}")]
    Io(String),
}

/// Failure to enqueue bytes for transmission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The transmit queue is at capacity. Backpressure: the caller decides
    /// whether to retry, back off, or surface the failure.
    #[error("transmit queue full for port {0}")]
    QueueFull(String),
    #[error("port {0} is not open")]
    NotOpen(String),
}

/// Failure composing on-wire bytes from command text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Offset is the index of the offending digit in the cleaned hex string
    /// (whitespace, commas, and `0x` prefixes removed). A dangling nibble
    /// reports the offset one past the last valid digit.
    #[error("invalid hex input at offset {offset}")]
    InvalidHex { offset: usize },
}

/// Failure of a file-transfer job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("port {0} is not open")]
    PortNotOpen(String),
    #[error("port {0} already has an active transfer")]
    TransferActive(String),
    #[error("transmit queue saturated after {0} retries")]
    QueueSaturated(u32),
    #[error("source read failed: {0}")]
    Source(String),
}

/// Failure to start a macro run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MacroError {
    #[error("a macro is already running")]
    AlreadyRunning,
    #[error("script has no selected steps")]
    EmptyScript,
}

/// A captured fault on its way to the sink of last resort.
#[derive(Debug, Clone)]
pub struct FaultReport {
    /// Component that faulted, e.g. `worker:/dev/ttyUSB0` or `macro-runner`.
    pub component: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

type ToastFn = dyn Fn(&FaultReport) + Send + Sync;

/// Captures uncaught failures from parallel tasks and panicking threads and
/// routes them to a single sink.
///
/// The sink is the tracing log; an optional toast callback mirrors each
/// report to a user-visible surface. Reports are drained by a dedicated task
/// so a fault can be filed from any thread, including the panic hook.
pub struct GlobalErrorHandler {
    tx: mpsc::UnboundedSender<FaultReport>,
    toast: parking_lot::RwLock<Option<Arc<ToastFn>>>,
}

impl GlobalErrorHandler {
    /// Create the handler and spawn its drain task. Must run inside a tokio
    /// runtime.
    pub fn install() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FaultReport>();
        let handler = Arc::new(Self {
            tx,
            toast: parking_lot::RwLock::new(None),
        });

        let drain = Arc::clone(&handler);
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                error!(
                    component = %report.component,
                    "uncaught fault: {}",
                    report.message
                );
                if let Some(toast) = drain.toast.read().clone() {
                    toast(&report);
                }
            }
        });

        handler
    }

    /// Mirror every fault to a user-visible notification surface.
    pub fn set_toast_sink(&self, sink: Arc<ToastFn>) {
        *self.toast.write() = Some(sink);
    }

    /// File a fault report. Never blocks; safe from any thread.
    pub fn report(&self, component: &str, message: impl Into<String>) {
        let _ = self.tx.send(FaultReport {
            component: component.to_string(),
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Install a process-wide panic hook that files panics from non-task
    /// threads before delegating to the previous hook.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let handler = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let thread = std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string();
            handler.report(&format!("thread:{thread}"), info.to_string());
            previous(info);
        }));
    }

    /// Spawn a task whose panic is captured and filed instead of being lost
    /// with the join handle. The returned handle resolves once the task has
    /// finished (normally or by panic).
    pub fn spawn_supervised<F>(self: &Arc<Self>, component: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = tokio::spawn(future);
        let handler = Arc::clone(self);
        let component = component.to_string();
        tokio::spawn(async move {
            if let Err(join_err) = inner.await {
                if join_err.is_panic() {
                    handler.report(&component, format!("task panicked: {join_err}"));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn open_error_kinds_are_stable() {
        assert_eq!(OpenError::Busy.kind(), "busy");
        assert_eq!(
            OpenError::InvalidParameters("baud".into()).kind(),
            "invalid_parameters"
        );
    }

    #[tokio::test]
    async fn supervised_task_panic_reaches_the_sink() {
        let handler = GlobalErrorHandler::install();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_toast = Arc::clone(&seen);
        handler.set_toast_sink(Arc::new(move |report: &FaultReport| {
            assert_eq!(report.component, "test-task");
            seen_in_toast.fetch_add(1, Ordering::SeqCst);
        }));

        let watcher = handler.spawn_supervised("test-task", async {
            panic!("boom");
        });
        watcher.await.unwrap();
        // The drain task runs on the same runtime; give it a turn.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn normal_task_files_no_report() {
        let handler = GlobalErrorHandler::install();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_toast = Arc::clone(&seen);
        handler.set_toast_sink(Arc::new(move |_: &FaultReport| {
            seen_in_toast.fetch_add(1, Ordering::SeqCst);
        }));
        let watcher = handler.spawn_supervised("quiet", async {});
        watcher.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
