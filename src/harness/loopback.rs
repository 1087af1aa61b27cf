//! Loopback delay test: paired playback/capture streams assumed physically
//! looped back
//!
//! Generates the tagged sequence on the playback side and measures, from the
//! capture side alone, how many frames of latency the loopback path adds.
//! Every fully-null capture period before the first valid data is one period
//! of latency; the first valid frame pins the sub-period remainder down via
//! its sequence tag (a frame tagged `k` means `k` frames of playback data
//! were already in flight when this capture period began).

use std::rc::Rc;

use anyhow::{bail, Result};
use tracing::{debug, error, warn};

use crate::harness::reactor::{IoToken, Reactor, StopReason, TestId};
use crate::harness::TestCase;
use crate::stats::aggregate::Aggregator;
use crate::stream::endpoint::{PeriodOutcome, StreamEndpoint};
use crate::stream::sequence::SequenceState;
use crate::stream::transport::{PcmStream, StreamConfig};

/// How the two streams of a loopback pair are started relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartSyncMode {
    /// Explicitly start the capture side, then write to trigger playback
    #[default]
    CaptureThenPlayback,
    /// Write first, then explicitly start the capture side
    PlaybackThenCapture,
    /// Streams are linked by the transport; starting one starts the other,
    /// so the explicit capture start is expected to be refused
    Linked,
}

/// Loopback test options.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackOptions {
    pub start_sync: StartSyncMode,
    /// When set, the measured delay must equal this many frames for the test
    /// to pass; when unset, any successful measurement passes
    pub assert_delay: Option<i64>,
}

/// Loopback delay test over one playback and one capture endpoint.
pub struct LoopbackDelayTest {
    playback: StreamEndpoint,
    capture: StreamEndpoint,
    opts: LoopbackOptions,
    delay_detected: bool,
    /// Measured delay in frames; negative when the capture side leads
    measured_delay: i64,
    exit_status: i32,
    id: Option<TestId>,
    token_p: Option<IoToken>,
    token_c: Option<IoToken>,
}

impl LoopbackDelayTest {
    /// Build the test from a playback and a capture stream sharing one
    /// configuration. Fails on endpoints the harness cannot drive.
    pub fn new(
        config: &StreamConfig,
        playback: Box<dyn PcmStream>,
        capture: Box<dyn PcmStream>,
        opts: LoopbackOptions,
        aggregator: Rc<Aggregator>,
    ) -> Result<Self> {
        let playback = StreamEndpoint::new(config, playback, Rc::clone(&aggregator))?;
        let capture = StreamEndpoint::new(config, capture, aggregator)?;
        Ok(Self {
            playback,
            capture,
            opts,
            delay_detected: false,
            measured_delay: 0,
            exit_status: 1,
            id: None,
            token_p: None,
            token_c: None,
        })
    }

    /// Whether the delay measurement has completed.
    pub fn delay_detected(&self) -> bool {
        self.delay_detected
    }

    /// Measured loopback delay in frames.
    pub fn measured_delay(&self) -> i64 {
        self.measured_delay
    }

    /// Feed one checked capture period into the delay measurement.
    fn measure(&mut self) {
        if self.delay_detected {
            return;
        }
        let period = self.capture.period() as i64;
        match self.capture.sequencer().state() {
            SequenceState::Null => {
                // an entire period of silence is one period of latency
                self.measured_delay += period;
            }
            SequenceState::Valid => {
                let resync = i64::from(self.capture.sequencer().resync_frame());
                self.measured_delay += period - resync;
                self.delay_detected = true;
                warn!("measured delay: {} frames", self.measured_delay);
                match self.opts.assert_delay {
                    Some(expected) if expected != self.measured_delay => {
                        error!(
                            "assert: delay {} doesn't match the expected one {}",
                            self.measured_delay, expected
                        );
                        self.exit_status = 1;
                    }
                    Some(_) => {
                        warn!("good loopback delay");
                        self.exit_status = 0;
                    }
                    None => self.exit_status = 0,
                }
            }
            SequenceState::Invalid => {
                // the sequencer already logged the frame
                self.exit_status = 1;
            }
        }
    }
}

impl TestCase for LoopbackDelayTest {
    fn name(&self) -> &'static str {
        "loopback_delay"
    }

    fn device(&self) -> &str {
        self.playback.device()
    }

    fn start(&mut self, id: TestId, reactor: &mut Reactor) -> Result<()> {
        debug!("{}: loopback_delay start", self.device());
        self.id = Some(id);
        self.delay_detected = false;
        self.measured_delay = 0;
        // failed until the first valid frame arrives
        self.exit_status = 1;

        if let Err(e) = self.capture.prepare() {
            warn!("{}: loopback capture prepare failed: {}", self.capture.device(), e);
        }
        if let Err(e) = self.playback.prepare() {
            warn!("{}: loopback playback prepare failed: {}", self.playback.device(), e);
        }

        match self.opts.start_sync {
            StartSyncMode::CaptureThenPlayback => {
                debug!("start capture");
                if let Err(e) = self.capture.start_stream() {
                    bail!("{}: loopback capture start failed: {}", self.capture.device(), e);
                }
                debug!("start playback");
                if let Err(e) = self.playback.prime() {
                    bail!("{}: loopback playback start failed: {}", self.playback.device(), e);
                }
            }
            StartSyncMode::PlaybackThenCapture | StartSyncMode::Linked => {
                // playback first; a linked pair brings the capture side up
                // with it and refuses the explicit start below
                debug!("start playback");
                if let Err(e) = self.playback.prime() {
                    bail!("{}: loopback playback start failed: {}", self.playback.device(), e);
                }
                debug!("start capture");
                if let Err(e) = self.capture.start_stream() {
                    if self.opts.start_sync == StartSyncMode::PlaybackThenCapture {
                        bail!("{}: loopback capture start failed: {}", self.capture.device(), e);
                    }
                    debug!(
                        "{}: loopback capture start refused as expected: {}",
                        self.capture.device(),
                        e
                    );
                }
            }
        }

        self.token_p = Some(reactor.register_io(id, self.playback.readiness()));
        self.token_c = Some(reactor.register_io(id, self.capture.readiness()));
        Ok(())
    }

    fn on_ready(&mut self, token: IoToken, reactor: &mut Reactor) {
        if Some(token) == self.token_p {
            if self.playback.write_period() == PeriodOutcome::Fatal {
                reactor.request_stop(StopReason::Fatal);
            }
        } else if Some(token) == self.token_c {
            match self.capture.read_period() {
                PeriodOutcome::Complete => self.measure(),
                PeriodOutcome::Fatal => reactor.request_stop(StopReason::Fatal),
                PeriodOutcome::Short(_) | PeriodOutcome::Recovered => {}
            }
        }
    }

    fn on_timer(&mut self, _reactor: &mut Reactor) {
        // no fault schedule for loopback tests
    }

    fn close(&mut self, reactor: &mut Reactor) -> i32 {
        for token in [self.token_c, self.token_p].into_iter().flatten() {
            reactor.disable_io(token);
        }
        if let Some(id) = self.id {
            reactor.disarm_timer(id);
        }
        self.exit_status
    }
}
