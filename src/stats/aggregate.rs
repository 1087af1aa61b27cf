//! Process-wide error aggregation and the end-of-run summary
//!
//! Every [`FrameSequencer`](crate::stream::sequence::FrameSequencer) reports
//! counted errors into one shared [`Aggregator`]; the total is read once at
//! harness shutdown to decide the overall pass/fail exit code.

use std::cell::{Cell, RefCell};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::harness::reactor::StopReason;

/// Exit code for a clean run
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for a fatal stream error, setup failure or failed assertion
pub const EXIT_FAILURE: i32 = 1;

/// Exit code when the run completed but integrity errors were counted
pub const EXIT_SEQ_ERRORS: i32 = 2;

/// Shared counter of sequence errors across every active sequencer.
///
/// Shared through `Rc` and mutated only from dispatcher callbacks, so plain
/// interior mutability is enough; no locks are involved. The optional
/// notification hook fires once per detected error, enabling live aggregation
/// without polling.
#[derive(Default)]
pub struct Aggregator {
    total: Cell<u64>,
    notify: RefCell<Option<Box<dyn FnMut(u64)>>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked with the running total on each new error.
    pub fn set_notify(&self, callback: impl FnMut(u64) + 'static) {
        *self.notify.borrow_mut() = Some(Box::new(callback));
    }

    /// Record one newly detected sequence error.
    pub fn record_error(&self) {
        self.total.set(self.total.get() + 1);
        if let Some(callback) = self.notify.borrow_mut().as_mut() {
            callback(self.total.get());
        }
    }

    /// Total errors recorded so far.
    pub fn total(&self) -> u64 {
        self.total.get()
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("total", &self.total.get())
            .field("notify", &self.notify.borrow().is_some())
            .finish()
    }
}

/// Final status of one test case.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    /// Test variant name ("playback", "capture", "loopback_delay")
    pub name: String,
    /// Device the test ran against
    pub device: String,
    /// Status returned by the test's `close` (0 = success)
    pub status: i32,
}

/// End-of-run report built by the dispatcher at teardown.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// When the dispatcher loop was entered
    pub started_at: DateTime<Utc>,
    /// When the dispatcher loop exited
    pub finished_at: DateTime<Utc>,
    /// Why the loop stopped
    pub stop: StopReason,
    /// Per-test statuses, in creation order
    pub tests: Vec<TestOutcome>,
    /// Total sequence errors across every sequencer
    pub seq_errors: u64,
}

impl RunSummary {
    /// Fold the run into a process exit code.
    ///
    /// Fatal stream errors and failed per-test statuses dominate; a completed
    /// run with counted integrity errors gets its own dedicated code so
    /// callers can tell the two apart.
    pub fn exit_code(&self) -> i32 {
        if matches!(self.stop, StopReason::Fatal) || self.tests.iter().any(|t| t.status != 0) {
            EXIT_FAILURE
        } else if self.seq_errors > 0 {
            EXIT_SEQ_ERRORS
        } else {
            EXIT_SUCCESS
        }
    }

    /// Render the summary as pretty JSON for operator consumption.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
