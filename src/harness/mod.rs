//! Reactive test harness
//!
//! - Single-threaded event dispatcher ([`reactor`])
//! - Playback test: generate the tagged stream ([`playback`])
//! - Capture test: check the received stream ([`capture`])
//! - Loopback delay test: paired streams, delay measurement ([`loopback`])
//!
//! Each test is a state machine driven only by readiness callbacks and its
//! one-shot fault timer; all state mutation happens synchronously inside a
//! dispatcher callback.

pub mod capture;
pub mod loopback;
pub mod playback;
pub mod reactor;

#[cfg(test)]
pub(crate) mod testutil;

use std::time::Duration;

use anyhow::{ensure, Result};

use crate::harness::reactor::{IoToken, Reactor, TestId};

/// Starvation pause after a forced xrun, long enough for the hardware to
/// actually under/overrun.
pub const XRUN_STARVE: Duration = Duration::from_millis(500);

/// One test case driven by the dispatcher.
///
/// The polymorphic `start`/`close` pair mirrors the two-operation capability
/// set exposed to the (external) CLI layer; `on_ready`/`on_timer` are the
/// dispatcher-facing callbacks.
pub trait TestCase {
    /// Test variant name.
    fn name(&self) -> &'static str;

    /// Device this test runs against.
    fn device(&self) -> &str;

    /// Start the stream(s) and register descriptors/timers with the reactor.
    fn start(&mut self, id: TestId, reactor: &mut Reactor) -> Result<()>;

    /// Handle readiness of one of this test's descriptors.
    fn on_ready(&mut self, token: IoToken, reactor: &mut Reactor);

    /// Handle expiry of this test's fault timer.
    fn on_timer(&mut self, reactor: &mut Reactor);

    /// Tear down, releasing reactor registrations. Returns the test status
    /// (0 = success) folded into the process exit code.
    fn close(&mut self, reactor: &mut Reactor) -> i32;
}

/// Periodic stop/restart cycle: play for `play`, pause for `pause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartCycle {
    pub play: Duration,
    pub pause: Duration,
}

/// Optional synthetic fault schedule for playback/capture tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultOptions {
    /// Force an xrun by starving the stream, once per interval
    pub xrun_interval: Option<Duration>,
    /// Periodically stop and restart the stream
    pub restart: Option<RestartCycle>,
}

impl FaultOptions {
    /// At most one fault mode may be active per test instance.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.xrun_interval.is_none() || self.restart.is_none(),
            "at most one fault mode (xrun or restart) may be configured"
        );
        Ok(())
    }

    /// Initial fault state and timer delay, if any fault mode is configured.
    pub(crate) fn initial_schedule(&self) -> Option<(FaultState, Duration)> {
        if let Some(interval) = self.xrun_interval {
            Some((FaultState::WaitXrun, interval))
        } else {
            self.restart
                .map(|cycle| (FaultState::WaitStop, cycle.play))
        }
    }
}

/// Fault-injection timer state. A test is in exactly one state at a time;
/// transitions happen only on timer expiry or explicit start/stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FaultState {
    /// No fault injection configured
    #[default]
    Idle,
    /// Steady-state I/O, waiting to force the next xrun
    WaitXrun,
    /// Readiness interest dropped, stream starving
    WaitXrunEnd,
    /// Steady-state I/O, waiting to force the next stop
    WaitStop,
    /// Stream halted, waiting to restart
    WaitRestart,
}
