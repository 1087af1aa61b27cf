//! Capture test: drain a read stream and check the tagged sequence
//!
//! Steady state is one checked period per readiness event. The same fault
//! schedule as playback applies; a forced overrun surfaces as a transient
//! read error whose recovery path re-synchronizes the sequencer.

use std::rc::Rc;

use anyhow::{bail, Result};
use tracing::{debug, error, warn};

use crate::harness::reactor::{IoToken, Reactor, StopReason, TestId};
use crate::harness::{FaultOptions, FaultState, TestCase, XRUN_STARVE};
use crate::stats::aggregate::Aggregator;
use crate::stream::endpoint::{PeriodOutcome, StreamEndpoint};
use crate::stream::transport::{PcmStream, StreamConfig};

/// Capture test over one read-side endpoint.
pub struct CaptureTest {
    endpoint: StreamEndpoint,
    opts: FaultOptions,
    fault_state: FaultState,
    id: Option<TestId>,
    token: Option<IoToken>,
}

impl CaptureTest {
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

    /// The capture-side sequencer, for delay/error inspection.
    pub fn sequencer(&self) -> &crate::stream::sequence::FrameSequencer {
        self.endpoint.sequencer()
    }
}

impl TestCase for CaptureTest {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn device(&self) -> &str {
        self.endpoint.device()
    }

    fn start(&mut self, id: TestId, reactor: &mut Reactor) -> Result<()> {
        debug!("{}: capture start", self.endpoint.device());
        self.id = Some(id);

        if let Err(e) = self.endpoint.start_stream() {
            bail!("{}: capture start failed: {}", self.endpoint.device(), e);
        }
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
        if self.endpoint.read_period() == PeriodOutcome::Fatal {
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
                warn!("{}: force capture overrun", self.endpoint.device());
                // stop draining so the device buffer overruns
                reactor.disable_io(token);
                self.fault_state = FaultState::WaitXrunEnd;
                reactor.arm_timer(id, XRUN_STARVE);
            }

            FaultState::WaitXrunEnd => {
                warn!("{}: overrun starvation over, resuming I/O", self.endpoint.device());
                reactor.enable_io(token);
                self.fault_state = FaultState::WaitXrun;
                // unwrap is safe: WaitXrunEnd is only reachable in xrun mode
                reactor.arm_timer(id, self.opts.xrun_interval.unwrap());
            }

            FaultState::WaitStop => {
                warn!("{}: force capture stop", self.endpoint.device());
                self.endpoint.halt();
                reactor.disable_io(token);
                self.fault_state = FaultState::WaitRestart;
                reactor.arm_timer(id, self.opts.restart.unwrap().pause);
            }

            FaultState::WaitRestart => {
                warn!("{}: capture restart", self.endpoint.device());
                self.endpoint.notify_discontinuity();
                if let Err(e) = self.endpoint.prepare() {
                    error!("{}: capture prepare failed: {}", self.endpoint.device(), e);
                }
                match self.endpoint.start_stream() {
                    Ok(()) => {
                        reactor.enable_io(token);
                        self.fault_state = FaultState::WaitStop;
                        reactor.arm_timer(id, self.opts.restart.unwrap().play);
                    }
                    Err(e) => {
                        error!("{}: capture restart failure: {}", self.endpoint.device(), e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::testutil::{ReadStep, StubStream};
    use crate::stream::sequence::SequenceState;
    use crate::stream::transport::StreamError;
    use std::time::Duration;

    fn config() -> StreamConfig {
        StreamConfig {
            period: 8,
            ..StreamConfig::default()
        }
    }

    /// A forced gap that went through the recovery path must not count
    /// errors, while genuine corruption in the same run still does.
    #[test]
    fn test_recovery_resync_and_real_corruption() {
        let agg = Rc::new(Aggregator::new());
        let (stream, state) = StubStream::capture();
        {
            let mut s = state.borrow_mut();
            s.read_script.push_back(ReadStep::tagged(8, 2, 0));
            // overrun: transient error, then the stream resumes further
            // along the sequence
            s.read_script.push_back(ReadStep::Err(StreamError::Xrun));
            s.read_script.push_back(ReadStep::tagged(8, 2, 100));
            // one genuinely corrupted period: a sustained bad run
            s.read_script.push_back(ReadStep::corrupted(8, 2, 108));
            s.read_script.push_back(ReadStep::tagged(8, 2, 116));
        }

        let mut test = CaptureTest::new(
            &config(),
            Box::new(stream),
            FaultOptions::default(),
            Rc::clone(&agg),
        )
        .unwrap();
        let mut reactor = Reactor::new();
        test.start(TestId(0), &mut reactor).unwrap();
        let token = test.token.unwrap();

        test.on_ready(token, &mut reactor); // valid
        assert_eq!(agg.total(), 0);

        test.on_ready(token, &mut reactor); // xrun, recovered + resynced
        assert_eq!(test.sequencer().state(), SequenceState::Null);

        test.on_ready(token, &mut reactor); // valid again at a jumped tag
        assert_eq!(agg.total(), 0, "notified gap is not an error");
        assert_eq!(test.sequencer().state(), SequenceState::Valid);

        test.on_ready(token, &mut reactor); // corrupted period
        assert!(agg.total() > 0, "sustained corruption is counted");

        test.on_ready(token, &mut reactor); // back to valid
        assert_eq!(test.sequencer().state(), SequenceState::Valid);
    }

    #[test]
    fn test_unrecoverable_read_stops_the_loop() {
        let (stream, state) = StubStream::capture();
        state
            .borrow_mut()
            .read_script
            .push_back(ReadStep::Err(StreamError::Unrecoverable));

        let mut test = CaptureTest::new(
            &config(),
            Box::new(stream),
            FaultOptions::default(),
            Rc::new(Aggregator::new()),
        )
        .unwrap();
        let mut reactor = Reactor::new();
        test.start(TestId(0), &mut reactor).unwrap();

        test.on_ready(test.token.unwrap(), &mut reactor);
        assert_eq!(reactor.stop_requested(), Some(StopReason::Fatal));
    }

    #[test]
    fn test_restart_cycle_notifies_discontinuity() {
        let (stream, state) = StubStream::capture();
        state
            .borrow_mut()
            .read_script
            .push_back(ReadStep::tagged(8, 2, 0));

        let mut test = CaptureTest::new(
            &config(),
            Box::new(stream),
            FaultOptions {
                restart: Some(crate::harness::RestartCycle {
                    play: Duration::from_millis(100),
                    pause: Duration::from_millis(50),
                }),
                ..Default::default()
            },
            Rc::new(Aggregator::new()),
        )
        .unwrap();
        let mut reactor = Reactor::new();
        test.start(TestId(0), &mut reactor).unwrap();
        let token = test.token.unwrap();

        test.on_ready(token, &mut reactor);
        assert_eq!(test.sequencer().state(), SequenceState::Valid);

        // WaitStop fires
        test.on_timer(&mut reactor);
        assert!(state.borrow().halted);
        assert!(!reactor.io_enabled(token));

        // WaitRestart fires: sequencer forgets the old position
        test.on_timer(&mut reactor);
        assert_eq!(test.sequencer().state(), SequenceState::Null);
        assert!(reactor.io_enabled(token));
        assert_eq!(test.fault_state, FaultState::WaitStop);
    }
}
