//! One directional stream endpoint
//!
//! Wraps an opaque transport stream together with its period buffer and its
//! sequencer, and implements the per-readiness period I/O including the
//! transient-error recovery policy.

use std::rc::Rc;

use crossbeam_channel::Receiver;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::stats::aggregate::Aggregator;
use crate::stream::sequence::{FrameSequencer, MAX_CHANNELS};
use crate::stream::transport::{PcmStream, Readiness, StreamConfig, StreamError};

/// Endpoint construction failures. Fatal at test-construction time.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("expected exactly one readiness descriptor, transport exposes {0}")]
    DescriptorCount(usize),

    #[error("channel count {0} does not fit the sequence tag (max {MAX_CHANNELS})")]
    ChannelCount(usize),
}

/// Result of one period's worth of I/O on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodOutcome {
    /// A full period was transferred (and checked, on the capture side)
    Complete,
    /// Fewer frames than a period moved; logged, not fatal
    Short(usize),
    /// A transient error was recovered in place
    Recovered,
    /// The designated unrecoverable error, or recovery itself failed
    Fatal,
}

/// One directional stream plus its period buffer and sequencer.
pub struct StreamEndpoint {
    device: String,
    stream: Box<dyn PcmStream>,
    seq: FrameSequencer,
    buf: Vec<i16>,
    period: usize,
}

impl StreamEndpoint {
    /// Wrap `stream` according to `config`.
    ///
    /// Rejects transports that expose anything but exactly one readiness
    /// descriptor, and channel counts the sequence tag cannot encode.
    pub fn new(
        config: &StreamConfig,
        stream: Box<dyn PcmStream>,
        aggregator: Rc<Aggregator>,
    ) -> Result<Self, SetupError> {
        let descriptors = stream.readiness().len();
        if descriptors != 1 {
            return Err(SetupError::DescriptorCount(descriptors));
        }
        if !(1..=MAX_CHANNELS).contains(&config.channels) {
            return Err(SetupError::ChannelCount(config.channels));
        }
        let seq = FrameSequencer::new(config.channels, config.format, aggregator);
        Ok(Self {
            device: config.device.clone(),
            stream,
            seq,
            buf: vec![0i16; config.period * config.channels],
            period: config.period,
        })
    }

    /// Device name, for log attribution.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Period size in frames.
    pub fn period(&self) -> usize {
        self.period
    }

    /// The single readiness descriptor, cloned for reactor registration.
    pub fn readiness(&self) -> Receiver<Readiness> {
        self.stream.readiness()[0].clone()
    }

    /// This endpoint's sequencer.
    pub fn sequencer(&self) -> &FrameSequencer {
        &self.seq
    }

    /// Announce a deliberate discontinuity to the sequencer.
    pub fn notify_discontinuity(&mut self) {
        self.seq.notify_discontinuity();
    }

    /// Explicitly start the stream.
    pub fn start_stream(&mut self) -> Result<(), StreamError> {
        self.stream.start()
    }

    /// Stop the stream immediately, dropping pending frames.
    pub fn halt(&mut self) {
        if let Err(e) = self.stream.halt() {
            debug!("{}: halt returned: {}", self.device, e);
        }
    }

    /// Bring a stopped stream back to a startable state.
    pub fn prepare(&mut self) -> Result<(), StreamError> {
        self.stream.prepare()
    }

    /// Fill and write one period with no recovery, used to start (or restart)
    /// a playback stream by priming its buffer.
    pub fn prime(&mut self) -> Result<usize, StreamError> {
        self.seq.fill(&mut self.buf, self.period);
        self.stream.write(&self.buf, self.period)
    }

    /// Feed the stream one generated period.
    ///
    /// Transient write errors go through `recover` and one retry; the retry
    /// also restarts a stopped stream. Short writes are logged but tolerated.
    pub fn write_period(&mut self) -> PeriodOutcome {
        self.seq.fill(&mut self.buf, self.period);
        match self.stream.write(&self.buf, self.period) {
            Ok(n) if n == self.period => PeriodOutcome::Complete,
            Ok(n) => {
                error!(
                    "{}: wrote less than the expected period size: {} / {}",
                    self.device, n, self.period
                );
                PeriodOutcome::Short(n)
            }
            Err(e) => {
                warn!("{}: playback write failed: {}", self.device, e);
                if e.is_fatal() {
                    error!("{}: unrecoverable transport error", self.device);
                    return PeriodOutcome::Fatal;
                }
                if let Err(re) = self.stream.recover(e) {
                    warn!("{}: playback recover failed: {}", self.device, re);
                }
                // write the same period again to restart the stream
                match self.stream.write(&self.buf, self.period) {
                    Ok(_) => PeriodOutcome::Recovered,
                    Err(e) => {
                        error!("{}: playback write failed after recover: {}", self.device, e);
                        PeriodOutcome::Fatal
                    }
                }
            }
        }
    }

    /// Drain one period from the stream and check its sequence.
    ///
    /// Transient read errors go through `recover`, an explicit restart and a
    /// discontinuity notification so the gap is not counted. Short reads are
    /// logged and left unchecked.
    pub fn read_period(&mut self) -> PeriodOutcome {
        match self.stream.read(&mut self.buf, self.period) {
            Ok(n) if n == self.period => {
                self.seq.check(&self.buf, self.period);
                PeriodOutcome::Complete
            }
            Ok(n) => {
                error!(
                    "{}: read less than the expected period size: {} / {}",
                    self.device, n, self.period
                );
                PeriodOutcome::Short(n)
            }
            Err(e) => {
                warn!("{}: capture read failed: {}", self.device, e);
                if e.is_fatal() {
                    error!("{}: unrecoverable transport error", self.device);
                    return PeriodOutcome::Fatal;
                }
                if let Err(re) = self.stream.recover(e) {
                    error!("{}: capture recover failed: {}", self.device, re);
                }
                match self.stream.start() {
                    Ok(()) => {
                        self.seq.notify_discontinuity();
                        PeriodOutcome::Recovered
                    }
                    Err(se) => {
                        warn!("{}: capture start failed after recover: {}", self.device, se);
                        PeriodOutcome::Fatal
                    }
                }
            }
        }
    }
}
