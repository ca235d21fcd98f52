//! # Macro Runner
//!
//! Scripted command execution against live ports: send → await-match →
//! delay → branch, over an ordered list of steps. One macro runs at a time
//! system-wide.
//!
//! Steps are carried as `(row_index, step)` tuples; the row index is the
//! step's original ordinal in the script and is echoed in every lifecycle
//! event so a sorted or filtered view can still highlight the right row.
//!
//! ## Control model
//!
//! Pause, resume, and stop are flags on a shared [`MacroControl`]; the
//! runner polls them at every suspension point in ≤50 ms slices, so a signal
//! takes effect within the finer of the current delay remainder and 50 ms.
//! Stop is edge-triggered: once observed, no further bytes are sent. If the
//! targeted connection closes mid-step the step is cancelled and the run
//! ends in `Stopped`.
//!
//! ## Repeat semantics
//!
//! Per-step repeats resolve within one global iteration; the global repeat
//! counter decrements once per full pass over the script. `-1` means
//! unlimited in both positions.

use crate::bus::{Event, EventBus, topics};
use crate::command;
use crate::connection::ConnectionController;
use crate::error::MacroError;
use crate::expect::ExpectMatcher;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest interval between control-flag checks while waiting.
const SIGNAL_SLICE: Duration = Duration::from_millis(50);
/// Poll interval while paused.
const PAUSE_SLICE: Duration = Duration::from_millis(20);

/// One row of a macro script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroStep {
    /// Unselected steps are skipped without events.
    pub selected: bool,
    pub command: String,
    pub hex_mode: bool,
    pub use_prefix: bool,
    pub use_suffix: bool,
    /// Wait after the send (and after a successful match, if any).
    pub delay_after_ms: u64,
    /// Executions per visit; -1 repeats until stopped.
    pub repeat: i32,
    /// Response pattern; `None`/empty means fire-and-forget.
    pub expect: Option<String>,
    pub expect_timeout_ms: u64,
    /// Step row to continue from after a successful visit.
    pub jump_to: Option<usize>,
}

impl Default for MacroStep {
    fn default() -> Self {
        Self {
            selected: true,
            command: String::new(),
            hex_mode: false,
            use_prefix: false,
            use_suffix: true,
            delay_after_ms: 0,
            repeat: 1,
            expect: None,
            expect_timeout_ms: 1000,
            jump_to: None,
        }
    }
}

/// Script-wide execution options.
#[derive(Debug, Clone)]
pub struct MacroOptions {
    /// Full passes over the script; -1 repeats until stopped.
    pub repeat_count: i32,
    /// Send every step to all open connections instead of the current one.
    pub broadcast: bool,
    pub stop_on_error: bool,
    /// Command prefix/suffix applied where a step opts in.
    pub prefix: String,
    pub suffix: String,
}

impl Default for MacroOptions {
    fn default() -> Self {
        Self {
            repeat_count: 1,
            broadcast: false,
            stop_on_error: false,
            prefix: String::new(),
            suffix: "\\r\\n".to_string(),
        }
    }
}

/// Runner lifecycle: `Idle → Running ↔ Paused → {Completed|Stopped|Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroState {
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

/// Shared control surface of a running macro.
pub struct MacroControl {
    state: Mutex<MacroState>,
    paused: AtomicBool,
    stop: AtomicBool,
}

impl MacroControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(MacroState::Idle),
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> MacroState {
        *self.state.lock()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state == MacroState::Running {
            *state = MacroState::Paused;
        }
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state == MacroState::Paused {
            *state = MacroState::Running;
        }
    }

    /// Edge-triggered: once observed by the runner, no further bytes are
    /// sent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: MacroState) {
        *self.state.lock() = state;
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state(),
            MacroState::Completed | MacroState::Stopped | MacroState::Failed | MacroState::Idle
        )
    }
}

/// Starts macro tasks and enforces the one-at-a-time rule.
pub struct MacroRunner {
    controller: Arc<ConnectionController>,
    bus: Arc<EventBus>,
    active: Mutex<Option<Arc<MacroControl>>>,
}

enum RxSignal {
    Data { port_id: String, text: String },
    PortClosed(String),
}

#[derive(Debug, PartialEq)]
enum StepOutcome {
    Success { response: String },
    Failed { response: String },
    Cancelled,
}

#[derive(Debug, PartialEq)]
enum WaitOutcome {
    Elapsed,
    Matched,
    TimedOut,
    TargetClosed,
    Stopped,
}

impl MacroRunner {
    pub fn new(controller: Arc<ConnectionController>, bus: Arc<EventBus>) -> Self {
        Self {
            controller,
            bus,
            active: Mutex::new(None),
        }
    }

    /// Start a script. Returns the control handle, or `AlreadyRunning` while
    /// a previous run is still live.
    pub fn start(
        &self,
        script: Vec<(usize, MacroStep)>,
        options: MacroOptions,
    ) -> Result<Arc<MacroControl>, MacroError> {
        let steps: Vec<(usize, MacroStep)> = script
            .into_iter()
            .filter(|(_, step)| step.selected)
            .collect();
        if steps.is_empty() {
            return Err(MacroError::EmptyScript);
        }

        let mut active = self.active.lock();
        if let Some(existing) = active.as_ref() {
            if !existing.is_finished() {
                return Err(MacroError::AlreadyRunning);
            }
        }

        let control = Arc::new(MacroControl::new());
        *active = Some(Arc::clone(&control));

        let execution = ScriptExecution {
            controller: Arc::clone(&self.controller),
            bus: Arc::clone(&self.bus),
            control: Arc::clone(&control),
            options,
            steps,
        };
        tokio::spawn(execution.run());
        Ok(control)
    }

    pub fn current(&self) -> Option<Arc<MacroControl>> {
        self.active.lock().clone()
    }
}

struct ScriptExecution {
    controller: Arc<ConnectionController>,
    bus: Arc<EventBus>,
    control: Arc<MacroControl>,
    options: MacroOptions,
    steps: Vec<(usize, MacroStep)>,
}

impl ScriptExecution {
    async fn run(self) {
        let script_id = Uuid::new_v4();
        info!(%script_id, steps = self.steps.len(), "macro started");
        self.control.set_state(MacroState::Running);
        self.bus.publish_event(&Event::MacroStarted { script_id });

        // One subscription feeds response text and close notifications to
        // every step; each step drains stale signals before it waits.
        // Responses ride `port.packet`, which workers publish per parsed
        // packet as bytes arrive, not the coalesced batch topic the data
        // logger consumes.
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<RxSignal>();
        let subscription = self.bus.subscribe("port.*", move |topic, event| {
            match event {
                Event::Packet(packet) if topic == topics::PORT_PACKET => {
                    let _ = signal_tx.send(RxSignal::Data {
                        port_id: packet.port_id.clone(),
                        text: packet.text.clone(),
                    });
                }
                Event::PortClosed { port_id } => {
                    let _ = signal_tx.send(RxSignal::PortClosed(port_id.clone()));
                }
                _ => {}
            }
        });

        let final_state = self.run_steps(&mut signal_rx).await;
        self.bus.unsubscribe(subscription);
        self.control.set_state(final_state);

        let success = final_state == MacroState::Completed;
        info!(%script_id, ?final_state, "macro finished");
        self.bus.publish_event(&Event::MacroFinished { success });
    }

    async fn run_steps(&self, signals: &mut mpsc::UnboundedReceiver<RxSignal>) -> MacroState {
        let mut global_remaining = normalize_repeat(self.options.repeat_count);

        loop {
            let mut position = 0usize;
            while position < self.steps.len() {
                let (row_index, step) = &self.steps[position];
                let mut remaining = normalize_repeat(step.repeat);
                let mut jump_target = None;

                loop {
                    if self.control.stop_requested() {
                        return MacroState::Stopped;
                    }

                    self.bus.publish_event(&Event::MacroStepStarted {
                        row_index: *row_index,
                        step: step.clone(),
                    });
                    let outcome = self.run_one_step(step, signals).await;
                    let (success, response) = match &outcome {
                        StepOutcome::Success { response } => (true, response.clone()),
                        StepOutcome::Failed { response } => (false, response.clone()),
                        StepOutcome::Cancelled => (false, String::new()),
                    };
                    self.bus.publish_event(&Event::MacroStepCompleted {
                        row_index: *row_index,
                        success,
                        response_text: response,
                    });

                    match outcome {
                        StepOutcome::Cancelled => return MacroState::Stopped,
                        StepOutcome::Failed { .. } => {
                            if self.options.stop_on_error {
                                return MacroState::Failed;
                            }
                            warn!(row = row_index, "step failed, continuing");
                            break;
                        }
                        StepOutcome::Success { .. } => {}
                    }

                    if remaining > 0 {
                        remaining -= 1;
                    }
                    if remaining == 0 {
                        jump_target = step.jump_to;
                        break;
                    }
                    // remaining < 0: unlimited, re-execute until stop.
                }

                match jump_target {
                    Some(target_row) => {
                        // The jump names a row; find it among selected steps.
                        match self.steps.iter().position(|(row, _)| *row == target_row) {
                            Some(target_pos) => {
                                debug!(from = row_index, to = target_row, "jump");
                                position = target_pos;
                            }
                            None => {
                                warn!(target_row, "jump target not in script, advancing");
                                position += 1;
                            }
                        }
                    }
                    None => position += 1,
                }
            }

            if global_remaining > 0 {
                global_remaining -= 1;
            }
            if global_remaining == 0 {
                return MacroState::Completed;
            }
            if self.control.stop_requested() {
                return MacroState::Stopped;
            }
        }
    }

    async fn run_one_step(
        &self,
        step: &MacroStep,
        signals: &mut mpsc::UnboundedReceiver<RxSignal>,
    ) -> StepOutcome {
        // Stale response data from previous steps must not satisfy this
        // step's expect.
        while signals.try_recv().is_ok() {}

        let wire = match command::format(
            &step.command,
            step.hex_mode,
            step.use_prefix,
            step.use_suffix,
            &self.options.prefix,
            &self.options.suffix,
        ) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                warn!("step command rejected: {err}");
                return StepOutcome::Failed {
                    response: err.to_string(),
                };
            }
        };

        // Send, collecting the ports whose responses this step listens to.
        let targets: Vec<String> = if self.options.broadcast {
            let outcomes = self.controller.broadcast(&wire);
            let delivered: Vec<String> = outcomes
                .iter()
                .filter(|(_, ok)| *ok)
                .map(|(port, _)| port.clone())
                .collect();
            if delivered.is_empty() {
                return StepOutcome::Failed {
                    response: "no open connection accepted the command".into(),
                };
            }
            delivered
        } else {
            let Some(target) = self.controller.current() else {
                return StepOutcome::Failed {
                    response: "no current connection".into(),
                };
            };
            if let Err(err) = self.controller.send(&target, wire) {
                return StepOutcome::Failed {
                    response: err.to_string(),
                };
            }
            vec![target]
        };

        let expect = step.expect.as_deref().unwrap_or("");
        let mut response = String::new();
        if !expect.is_empty() {
            let mut matcher = ExpectMatcher::new();
            let outcome = self
                .await_match(
                    expect,
                    &targets,
                    Duration::from_millis(step.expect_timeout_ms),
                    &mut matcher,
                    signals,
                )
                .await;
            response = matcher.buffered().to_string();
            match outcome {
                WaitOutcome::Matched => {}
                WaitOutcome::TimedOut => return StepOutcome::Failed { response },
                WaitOutcome::TargetClosed | WaitOutcome::Stopped => return StepOutcome::Cancelled,
                WaitOutcome::Elapsed => unreachable!("match wait cannot merely elapse"),
            }
        }

        if step.delay_after_ms > 0 {
            match self
                .await_delay(Duration::from_millis(step.delay_after_ms), &targets, signals)
                .await
            {
                WaitOutcome::Elapsed => {}
                WaitOutcome::TargetClosed | WaitOutcome::Stopped => return StepOutcome::Cancelled,
                _ => {}
            }
        }

        StepOutcome::Success { response }
    }

    /// Wait for `pattern` over the targets' response text, up to `limit`.
    /// Pause freezes the clock; stop and target closure end the wait.
    async fn await_match(
        &self,
        pattern: &str,
        targets: &[String],
        limit: Duration,
        matcher: &mut ExpectMatcher,
        signals: &mut mpsc::UnboundedReceiver<RxSignal>,
    ) -> WaitOutcome {
        let mut deadline = Instant::now() + limit;
        loop {
            if self.control.stop_requested() {
                return WaitOutcome::Stopped;
            }
            if self.control.is_paused() {
                let pause_started = Instant::now();
                tokio::time::sleep(PAUSE_SLICE).await;
                deadline += pause_started.elapsed();
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let slice = (deadline - now).min(SIGNAL_SLICE);
            match tokio::time::timeout(slice, signals.recv()).await {
                Ok(Some(RxSignal::Data { port_id, text })) => {
                    if targets.contains(&port_id) {
                        matcher.append(&text);
                        if matcher.is_match(pattern) {
                            return WaitOutcome::Matched;
                        }
                    }
                }
                Ok(Some(RxSignal::PortClosed(port_id))) => {
                    if targets.contains(&port_id) {
                        return WaitOutcome::TargetClosed;
                    }
                }
                Ok(None) => return WaitOutcome::Stopped,
                Err(_elapsed) => {}
            }
        }
    }

    /// Interruptible `delay_after` wait.
    async fn await_delay(
        &self,
        delay: Duration,
        targets: &[String],
        signals: &mut mpsc::UnboundedReceiver<RxSignal>,
    ) -> WaitOutcome {
        let mut remaining = delay;
        loop {
            if self.control.stop_requested() {
                return WaitOutcome::Stopped;
            }
            if self.control.is_paused() {
                tokio::time::sleep(PAUSE_SLICE).await;
                continue;
            }
            // Closure of a target during the delay cancels the step.
            while let Ok(signal) = signals.try_recv() {
                if let RxSignal::PortClosed(port_id) = signal {
                    if targets.contains(&port_id) {
                        return WaitOutcome::TargetClosed;
                    }
                }
            }
            if remaining.is_zero() {
                return WaitOutcome::Elapsed;
            }
            let slice = remaining.min(SIGNAL_SLICE);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }
}

/// `0` and `1` both mean one execution; negative means unlimited.
fn normalize_repeat(count: i32) -> i32 {
    if count == 0 {
        1
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_normalization() {
        assert_eq!(normalize_repeat(0), 1);
        assert_eq!(normalize_repeat(1), 1);
        assert_eq!(normalize_repeat(5), 5);
        assert_eq!(normalize_repeat(-1), -1);
    }

    #[test]
    fn default_step_is_selected_once_with_suffix() {
        let step = MacroStep::default();
        assert!(step.selected);
        assert_eq!(step.repeat, 1);
        assert!(step.use_suffix);
        assert!(!step.use_prefix);
    }

    #[test]
    fn control_state_transitions() {
        let control = MacroControl::new();
        control.set_state(MacroState::Running);
        control.pause();
        assert_eq!(control.state(), MacroState::Paused);
        control.resume();
        assert_eq!(control.state(), MacroState::Running);
        control.stop();
        assert!(control.stop_requested());
        assert!(!control.is_paused());
    }
}
