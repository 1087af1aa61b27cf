//! Playback test: continuously feed the tagged sequence to a write stream
//!
//! Steady state is one generated period per readiness event. The optional
//! fault schedule either starves the stream to force periodic xruns, or
//! cycles the stream through forced stop/restart.

use std::rc::Rc;

use anyhow::{anyhow, Result};
use tracing::{debug, error, warn};

use crate::harness::reactor::{IoToken, Reactor, StopReason, TestId};
use crate::harness::{FaultOptions, FaultState, TestCase, XRUN_STARVE};
use crate::stats::aggregate::Aggregator;
use crate::stream::endpoint::{PeriodOutcome, StreamEndpoint};
use crate::stream::transport::{PcmStream, StreamConfig};

/// Playback test over one write-side endpoint.
pub struct PlaybackTest {
    endpoint: StreamEndpoint,
    opts: FaultOptions,
    fault_state: FaultState,
    id: Option<TestId>,
    token: Option<IoToken>,
}

impl PlaybackTest {
    /// Build the test. Fails on conflicting fault modes or an endpoint the
    /// harness cannot drive; the caller must then abort startup.
    pub fn new(
        config: &StreamConfig,
        stream: Box<dyn PcmStream>,
        opts: FaultOptions,
        aggregator: Rc<Aggregator>,
    ) -> Result<Self> {
        opts.validate()?;
        let endpoint = StreamEndpoint::new(config, stream, aggregator)?;
        Ok(Self {
            endpoint,
            opts,
            fault_state: FaultState::Idle,
            id: None,
            token: None,
        })
    }
}

impl TestCase for PlaybackTest {
    fn name(&self) -> &'static str {
        "playback"
    }

    fn device(&self) -> &str {
        self.endpoint.device()
    }

    fn start(&mut self, id: TestId, reactor: &mut Reactor) -> Result<()> {
        debug!("{}: playback start", self.endpoint.device());
        self.id = Some(id);

        // prime the stream with a first period; playback starts implicitly
        // once the buffer fills
        self.endpoint.prime().map_err(|e| {
            anyhow!("{}: playback start failure: {}", self.endpoint.device(), e)
        })?;
        self.token = Some(reactor.register_io(id, self.endpoint.readiness()));

        if let Some((state, delay)) = self.opts.initial_schedule() {
            debug!(
                "{}: fault schedule {:?}, first firing in {:?}",
                self.endpoint.device(),
                state,
                delay
            );
            self.fault_state = state;
            reactor.arm_timer(id, delay);
        }
        Ok(())
    }

    fn on_ready(&mut self, _token: IoToken, reactor: &mut Reactor) {
        if self.endpoint.write_period() == PeriodOutcome::Fatal {
            reactor.request_stop(StopReason::Fatal);
        }
    }

    fn on_timer(&mut self, reactor: &mut Reactor) {
        let (id, token) = match (self.id, self.token) {
            (Some(id), Some(token)) => (id, token),
            _ => return,
        };
        match self.fault_state {
            FaultState::Idle => {}

            FaultState::WaitXrun => {
                warn!("{}: force playback xrun", self.endpoint.device());
                // stop handling readiness so the buffer drains dry
                reactor.disable_io(token);
                self.fault_state = FaultState::WaitXrunEnd;
                reactor.arm_timer(id, XRUN_STARVE);
            }

            FaultState::WaitXrunEnd => {
                warn!("{}: xrun starvation over, resuming I/O", self.endpoint.device());
                reactor.enable_io(token);
                self.fault_state = FaultState::WaitXrun;
                // unwrap is safe: WaitXrunEnd is only reachable in xrun mode
                reactor.arm_timer(id, self.opts.xrun_interval.unwrap());
            }

            FaultState::WaitStop => {
                warn!("{}: force playback stop", self.endpoint.device());
                self.endpoint.halt();
                reactor.disable_io(token);
                self.fault_state = FaultState::WaitRestart;
                reactor.arm_timer(id, self.opts.restart.unwrap().pause);
            }

            FaultState::WaitRestart => {
                warn!("{}: playback restart", self.endpoint.device());
                self.endpoint.notify_discontinuity();
                if let Err(e) = self.endpoint.prepare() {
                    error!("{}: playback prepare failed: {}", self.endpoint.device(), e);
                }
                match self.endpoint.prime() {
                    Ok(_) => {
                        reactor.enable_io(token);
                        self.fault_state = FaultState::WaitStop;
                        reactor.arm_timer(id, self.opts.restart.unwrap().play);
                    }
                    Err(e) => {
                        error!("{}: playback restart failure: {}", self.endpoint.device(), e);
                        reactor.request_stop(StopReason::Fatal);
                    }
                }
            }
        }
    }

    fn close(&mut self, reactor: &mut Reactor) -> i32 {
        if let Some(token) = self.token {
            reactor.disable_io(token);
        }
        if let Some(id) = self.id {
            reactor.disarm_timer(id);
        }
        0
    }
}
