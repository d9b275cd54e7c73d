//! [`RunManager`] – the process-wide run state machine.
//!
//! ```text
//! IDLE ──arm──▶ ARMED ──start──▶ RUNNING ──complete──▶ IDLE
//!                 │                 ├──abort──▶ ABORTED ──▶ IDLE
//!                 └──cancel──▶ IDLE └──set_error──▶ ERROR ──reset──▶ IDLE
//! ```
//!
//! The abort flag is *sticky*: entering IDLE does not clear it, only the next
//! `arm` or `start` does.  Background work started under the aborted run
//! therefore keeps seeing the abort even after the state machine has settled
//! back to IDLE.
//!
//! Subsystems that must react to an abort (output disable, monitor stop)
//! register a named shutdown callback; [`RunManager::abort`] runs every one
//! of them, logging failures and panics without letting one block the rest.

use std::cell::RefCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ivcore_types::{AbortSignal, IvError};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Default interval at which [`RunManager::sleep`] polls the abort flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ────────────────────────────────────────────────────────────────────────────
// Run state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Idle,
    Armed,
    Running,
    Aborted,
    Error,
}

impl RunState {
    pub const ALL: [RunState; 5] = [
        RunState::Idle,
        RunState::Armed,
        RunState::Running,
        RunState::Aborted,
        RunState::Error,
    ];

    /// Whether `self → next` is an edge of the transition table.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Armed)
                | (Armed, Running)
                | (Armed, Idle)
                | (Running, Idle)
                | (Running, Aborted)
                | (Running, Error)
                | (Aborted, Idle)
                | (Error, Idle)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "IDLE",
            RunState::Armed => "ARMED",
            RunState::Running => "RUNNING",
            RunState::Aborted => "ABORTED",
            RunState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by [`RunManager::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub state: RunState,
    pub uptime_s: f64,
    pub run_started_at: Option<DateTime<Utc>>,
    pub run_duration_s: Option<f64>,
    pub error_message: Option<String>,
    pub abort_requested: bool,
    pub steps_completed: usize,
    pub total_steps: usize,
}

/// Emergency action run on abort.
pub type ShutdownCallback = Arc<dyn Fn() -> Result<(), IvError> + Send + Sync>;

struct RunInner {
    state: RunState,
    run_started: Option<(Instant, DateTime<Utc>)>,
    error_message: Option<String>,
    steps_completed: usize,
    total_steps: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// RunManager
// ────────────────────────────────────────────────────────────────────────────

/// Process-wide run state machine with a sticky abort flag.
///
/// Construct one per process and share it via `Arc`; it implements
/// [`AbortSignal`] so the registry and protocol engine can observe aborts
/// without depending on this crate.
///
/// # Example
///
/// ```
/// use ivcore_kernel::run_manager::{RunManager, RunState};
///
/// let rm = RunManager::new();
/// assert!(rm.arm());
/// assert!(rm.start());
/// rm.abort();
/// assert_eq!(rm.state(), RunState::Idle);
/// assert!(rm.is_abort_requested());
/// assert!(rm.arm());
/// assert!(!rm.is_abort_requested());
/// ```
pub struct RunManager {
    inner: ReentrantMutex<RefCell<RunInner>>,
    abort_requested: AtomicBool,
    callbacks: Mutex<Vec<(String, ShutdownCallback)>>,
    created: Instant,
    poll_interval: Duration,
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RunManager {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// A manager whose [`sleep`](RunManager::sleep) checks the abort flag
    /// every `poll_interval`.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        info!(?poll_interval, "run manager initialised");
        Self {
            inner: ReentrantMutex::new(RefCell::new(RunInner {
                state: RunState::Idle,
                run_started: None,
                error_message: None,
                steps_completed: 0,
                total_steps: 0,
            })),
            abort_requested: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            created: Instant::now(),
            poll_interval,
        }
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().borrow().state
    }

    /// Attempt one edge of the transition table.  Illegal edges are logged
    /// and leave the state untouched.
    pub fn transition_to(&self, next: RunState, error_message: Option<&str>) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let current = inner.state;
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "invalid run state transition");
            return false;
        }
        inner.state = next;
        match next {
            RunState::Running => {
                inner.run_started = Some((Instant::now(), Utc::now()));
                self.abort_requested.store(false, Ordering::SeqCst);
            }
            RunState::Armed => {
                self.abort_requested.store(false, Ordering::SeqCst);
            }
            RunState::Error => {
                inner.error_message = error_message.map(str::to_string);
            }
            RunState::Idle => {
                inner.run_started = None;
                inner.error_message = None;
                inner.steps_completed = 0;
                inner.total_steps = 0;
            }
            RunState::Aborted => {}
        }
        info!(from = %current, to = %next, "run state transition");
        true
    }

    /// IDLE → ARMED.
    pub fn arm(&self) -> bool {
        self.transition_to(RunState::Armed, None)
    }

    /// ARMED → RUNNING.
    pub fn start(&self) -> bool {
        self.transition_to(RunState::Running, None)
    }

    /// RUNNING → IDLE.
    pub fn complete(&self) -> bool {
        self.transition_to(RunState::Idle, None)
    }

    /// RUNNING → ERROR, recording `message`.
    pub fn set_error(&self, message: &str) -> bool {
        self.transition_to(RunState::Error, Some(message))
    }

    /// Force ERROR with `message` from any state but ERROR.
    ///
    /// For failures that must be recorded even when the run has already
    /// left RUNNING.  Returns `false` (keeping the first message) when the
    /// manager is already in ERROR.
    pub fn fail(&self, message: &str) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let current = inner.state;
        if current == RunState::Error {
            warn!(error = message, "run already in ERROR; keeping first message");
            return false;
        }
        inner.state = RunState::Error;
        inner.error_message = Some(message.to_string());
        error!(from = %current, to = %RunState::Error, error = message, "run failed");
        true
    }

    /// ERROR/ABORTED → IDLE.  Already IDLE counts as success.
    pub fn reset(&self) -> bool {
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        match state {
            RunState::Error | RunState::Aborted => self.transition_to(RunState::Idle, None),
            RunState::Idle => true,
            RunState::Armed | RunState::Running => false,
        }
    }

    /// Request an abort from any state.
    ///
    /// Sets the sticky flag, runs every shutdown callback, then forces the
    /// state machine through ABORTED (if RUNNING) to IDLE.  Always returns
    /// `true`.
    pub fn abort(&self) -> bool {
        warn!("ABORT requested");
        self.abort_requested.store(true, Ordering::SeqCst);

        let callbacks: Vec<(String, ShutdownCallback)> = self.callbacks.lock().clone();
        for (name, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(Ok(())) => debug!(callback = %name, "shutdown callback done"),
                Ok(Err(e)) => error!(callback = %name, error = %e, "shutdown callback failed"),
                Err(_) => error!(callback = %name, "shutdown callback panicked"),
            }
        }

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.state == RunState::Running {
            inner.state = RunState::Aborted;
            info!(from = %RunState::Running, to = %RunState::Aborted, "run state transition");
        }
        if inner.state != RunState::Idle {
            info!(from = %inner.state, to = %RunState::Idle, "abort complete");
            inner.state = RunState::Idle;
        }
        inner.run_started = None;
        inner.error_message = None;
        inner.steps_completed = 0;
        inner.total_steps = 0;
        true
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, checking the abort flag every poll interval.
    /// Returns `false` if the wait was cut short by an abort.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_abort_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Register a named emergency action run by [`abort`](RunManager::abort).
    pub fn register_shutdown_callback<F>(&self, name: &str, callback: F)
    where
        F: Fn() -> Result<(), IvError> + Send + Sync + 'static,
    {
        debug!(callback = name, "registered shutdown callback");
        self.callbacks
            .lock()
            .push((name.to_string(), Arc::new(callback)));
    }

    pub fn set_progress(&self, completed: usize, total: usize) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.steps_completed = completed;
        inner.total_steps = total;
    }

    pub fn uptime(&self) -> Duration {
        self.created.elapsed()
    }

    /// Time since the current run entered RUNNING.
    pub fn run_duration(&self) -> Option<Duration> {
        self.inner
            .lock()
            .borrow()
            .run_started
            .map(|(started, _)| started.elapsed())
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.lock().borrow().error_message.clone()
    }

    pub fn status(&self) -> RunStatus {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        RunStatus {
            state: inner.state,
            uptime_s: round2(self.uptime().as_secs_f64()),
            run_started_at: inner.run_started.map(|(_, at)| at),
            run_duration_s: inner
                .run_started
                .map(|(started, _)| round2(started.elapsed().as_secs_f64())),
            error_message: inner.error_message.clone(),
            abort_requested: self.is_abort_requested(),
            steps_completed: inner.steps_completed,
            total_steps: inner.total_steps,
        }
    }
}

impl AbortSignal for RunManager {
    fn is_abort_requested(&self) -> bool {
        RunManager::is_abort_requested(self)
    }

    fn sleep(&self, duration: Duration) -> bool {
        RunManager::sleep(self, duration)
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
