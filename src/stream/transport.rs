//! Opaque transport abstraction for one directional PCM stream
//!
//! The harness never opens or configures devices itself; the embedder hands it
//! a boxed [`PcmStream`] per direction. Readiness is delivered as messages on
//! a crossbeam channel so the single-threaded dispatcher can multiplex every
//! stream plus the control channel in one blocking wait.

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DEFAULT_BUFFER_PERIODS, DEFAULT_PERIOD_FRAMES, DEFAULT_SAMPLE_RATE};

/// Errors reported by a transport stream.
///
/// `Xrun`, `Suspended` and `Io` are transient: the harness hands them back to
/// [`PcmStream::recover`] and retries. `Unrecoverable` is the designated fatal
/// code that stops the whole dispatcher loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("buffer underrun/overrun (xrun)")]
    Xrun,

    #[error("stream suspended")]
    Suspended,

    #[error("stream is in an unrecoverable state")]
    Unrecoverable,

    #[error("transport error: {0}")]
    Io(String),
}

impl StreamError {
    /// Whether this error must abort the run rather than go through recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Unrecoverable)
    }
}

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Samples flow from the harness into the device
    Playback,
    /// Samples flow from the device into the harness
    Capture,
}

/// Sample format of the transported stream.
///
/// Only S16LE is implemented by the sequencer; the enum is the seam for
/// future formats and unsupported values degrade to a no-op fill/check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian, the single supported format
    #[default]
    S16Le,
    /// Signed 32-bit little-endian (not implemented, fill/check are no-ops)
    S32Le,
}

/// Stream configuration as negotiated by the (external) transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Device name, used for log attribution only
    pub device: String,
    /// Sample rate in Hz
    pub rate: u32,
    /// Number of interleaved channels (bounded by the 5-bit tag field)
    pub channels: usize,
    /// Sample format
    pub format: SampleFormat,
    /// Period size in frames; one read/write call moves one period
    pub period: usize,
    /// Buffer depth in periods
    pub buffer_periods: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            device: String::from("default"),
            rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
            format: SampleFormat::S16Le,
            period: DEFAULT_PERIOD_FRAMES,
            buffer_periods: DEFAULT_BUFFER_PERIODS,
        }
    }
}

/// Readiness event delivered on a stream's descriptor channel.
///
/// One message means the stream can absorb or supply at least one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness;

/// One directional PCM stream handle.
///
/// Implementations wrap the real transport (or a scripted mock in tests). All
/// calls are made from the dispatcher thread; implementations do not need to
/// be thread-safe.
pub trait PcmStream {
    /// Direction of this stream.
    fn direction(&self) -> Direction;

    /// Explicitly start the stream (capture side, or linked pairs).
    fn start(&mut self) -> Result<(), StreamError>;

    /// Stop the stream immediately, dropping pending frames.
    fn halt(&mut self) -> Result<(), StreamError>;

    /// Bring a stopped stream back to a startable state.
    fn prepare(&mut self) -> Result<(), StreamError>;

    /// Attempt transport-level recovery from a transient error.
    fn recover(&mut self, err: StreamError) -> Result<(), StreamError>;

    /// Read up to `frames` frames into `buf`, returning the count actually read.
    fn read(&mut self, buf: &mut [i16], frames: usize) -> Result<usize, StreamError>;

    /// Write up to `frames` frames from `buf`, returning the count actually written.
    fn write(&mut self, buf: &[i16], frames: usize) -> Result<usize, StreamError>;

    /// Readiness descriptors for this stream.
    ///
    /// The harness requires exactly one; endpoints reject multi-descriptor
    /// transports at creation time.
    fn readiness(&self) -> &[Receiver<Readiness>];
}
