//! Single-threaded event dispatcher
//!
//! Blocks once per iteration on descriptor readiness or timer expiry and
//! delivers exactly one callback before blocking again. Readiness descriptors
//! are crossbeam channels, multiplexed together with the operator control
//! channel through `Select`; timers are one-shot relative deadlines, one slot
//! per test, checked before blocking so pending I/O cannot starve them.
//!
//! Ordering guarantee: the control channel is polled before any per-test I/O
//! event is dispatched, so a quit request wins the iteration and remaining
//! ready I/O is discarded.

use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::{Receiver, Select, TryRecvError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::harness::TestCase;
use crate::stats::aggregate::{Aggregator, RunSummary, TestOutcome};
use crate::stream::transport::Readiness;

/// Identifies one test case within a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestId(pub(crate) usize);

/// Identifies one registered readiness descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoToken(pub(crate) usize);

/// Operator message on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    /// Stop the loop (sent by the embedder, e.g. from a signal handler)
    Quit,
}

/// Why the dispatcher loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Explicit quit message on the control channel
    Quit,
    /// End of input: the control channel sender went away
    ControlEof,
    /// A fatal stream error
    Fatal,
}

struct IoSlot {
    rx: Receiver<Readiness>,
    owner: TestId,
    enabled: bool,
}

/// Registration surface handed to test callbacks.
///
/// Callbacks never re-enter the dispatcher's wait; they only mutate interest,
/// timers and the pending stop reason, which the dispatcher applies on its
/// next iteration.
#[derive(Default)]
pub struct Reactor {
    ios: Vec<IoSlot>,
    timers: Vec<Option<Instant>>,
    stop: Option<StopReason>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a readiness descriptor for `owner`. Interest starts enabled.
    pub fn register_io(&mut self, owner: TestId, rx: Receiver<Readiness>) -> IoToken {
        self.ios.push(IoSlot {
            rx,
            owner,
            enabled: true,
        });
        IoToken(self.ios.len() - 1)
    }

    /// Resume readiness interest for a registered descriptor.
    pub fn enable_io(&mut self, token: IoToken) {
        self.ios[token.0].enabled = true;
    }

    /// Drop readiness interest without unregistering.
    pub fn disable_io(&mut self, token: IoToken) {
        self.ios[token.0].enabled = false;
    }

    /// Whether readiness interest is currently enabled.
    pub fn io_enabled(&self, token: IoToken) -> bool {
        self.ios[token.0].enabled
    }

    /// Arm (or re-arm) the one-shot timer of `id`, relative to now.
    pub fn arm_timer(&mut self, id: TestId, after: Duration) {
        if self.timers.len() <= id.0 {
            self.timers.resize(id.0 + 1, None);
        }
        self.timers[id.0] = Some(Instant::now() + after);
    }

    /// Disarm the timer of `id` if armed.
    pub fn disarm_timer(&mut self, id: TestId) {
        if let Some(slot) = self.timers.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Request loop termination; the first reason wins.
    pub fn request_stop(&mut self, reason: StopReason) {
        if self.stop.is_none() {
            self.stop = Some(reason);
        }
    }

    /// Pending stop reason, if any.
    pub fn stop_requested(&self) -> Option<StopReason> {
        self.stop
    }

    /// Earliest armed deadline.
    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().flatten().min().copied()
    }

    /// Take the due timer with the earliest deadline, if one expired.
    fn take_due_timer(&mut self, now: Instant) -> Option<TestId> {
        let due = self
            .timers
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|d| (d, i)))
            .filter(|&(d, _)| d <= now)
            .min()?;
        self.timers[due.1] = None;
        Some(TestId(due.1))
    }

    /// Consume one readiness event from a ready slot.
    ///
    /// A disconnected descriptor means the stream side is gone; its interest
    /// is dropped so the loop does not spin on it.
    fn take_ready(&mut self, slot_idx: usize) -> Option<(TestId, IoToken)> {
        let slot = &mut self.ios[slot_idx];
        match slot.rx.try_recv() {
            Ok(Readiness) => Some((slot.owner, IoToken(slot_idx))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                warn!("readiness descriptor {} disconnected", slot_idx);
                slot.enabled = false;
                None
            }
        }
    }
}

enum ReadyOp {
    Control,
    Io(usize),
}

/// The single-threaded reactor driving every registered test case.
pub struct EventDispatcher {
    reactor: Reactor,
    tests: Vec<Box<dyn TestCase>>,
    control: Receiver<ControlMsg>,
    aggregator: Rc<Aggregator>,
}

impl EventDispatcher {
    pub fn new(control: Receiver<ControlMsg>, aggregator: Rc<Aggregator>) -> Self {
        Self {
            reactor: Reactor::new(),
            tests: Vec::new(),
            control,
            aggregator,
        }
    }

    /// Add a test case. Tests are started, dispatched and closed in the order
    /// they were added.
    pub fn add_test(&mut self, test: Box<dyn TestCase>) -> TestId {
        self.tests.push(test);
        TestId(self.tests.len() - 1)
    }

    /// Registration surface, exposed for direct state inspection in tests.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Start every test in creation order. The first failure aborts startup.
    pub fn start(&mut self) -> Result<()> {
        for (i, test) in self.tests.iter_mut().enumerate() {
            test.start(TestId(i), &mut self.reactor)
                .with_context(|| format!("starting test {} failed", test.name()))?;
        }
        Ok(())
    }

    /// Run until a stop is requested, then close every test in creation
    /// order and report.
    pub fn run(&mut self) -> RunSummary {
        let started_at = Utc::now();

        loop {
            if self.reactor.stop.is_some() {
                break;
            }

            // due timers fire before blocking, so a busy descriptor cannot
            // starve fault injection
            let now = Instant::now();
            if let Some(id) = self.reactor.take_due_timer(now) {
                let (test, reactor) = (&mut self.tests[id.0], &mut self.reactor);
                test.on_timer(reactor);
                continue;
            }

            let ready = {
                let mut sel = Select::new();
                sel.recv(&self.control);
                let mut slots = Vec::with_capacity(self.reactor.ios.len());
                for (i, slot) in self.reactor.ios.iter().enumerate() {
                    if slot.enabled {
                        sel.recv(&slot.rx);
                        slots.push(i);
                    }
                }
                match self.reactor.next_deadline() {
                    Some(deadline) => match sel.ready_deadline(deadline) {
                        Ok(index) => Some(index),
                        // timer expired, handled at the top of the loop
                        Err(_) => None,
                    },
                    None => Some(sel.ready()),
                }
                .map(|index| {
                    if index == 0 {
                        ReadyOp::Control
                    } else {
                        ReadyOp::Io(slots[index - 1])
                    }
                })
            };

            // the control channel wins the iteration over any ready I/O
            match self.control.try_recv() {
                Ok(ControlMsg::Quit) => {
                    debug!("quit requested on the control channel");
                    self.reactor.request_stop(StopReason::Quit);
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    debug!("control channel closed");
                    self.reactor.request_stop(StopReason::ControlEof);
                    continue;
                }
                Err(TryRecvError::Empty) => {}
            }

            if let Some(ReadyOp::Io(slot_idx)) = ready {
                if let Some((owner, token)) = self.reactor.take_ready(slot_idx) {
                    let (test, reactor) = (&mut self.tests[owner.0], &mut self.reactor);
                    test.on_ready(token, reactor);
                }
            }
        }

        let stop = self.reactor.stop.take().unwrap_or(StopReason::ControlEof);
        let tests = self
            .tests
            .iter_mut()
            .map(|test| {
                let status = test.close(&mut self.reactor);
                debug!("{}: closed with status {}", test.name(), status);
                TestOutcome {
                    name: test.name().to_string(),
                    device: test.device().to_string(),
                    status,
                }
            })
            .collect();

        RunSummary {
            started_at,
            finished_at: Utc::now(),
            stop,
            tests,
            seq_errors: self.aggregator.total(),
        }
    }
}
