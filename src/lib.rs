//! Streamtester - audio stream data-integrity test harness
//!
//! Exercises an audio streaming transport (playback and/or capture) to detect
//! dropped periods, xruns, frame reordering and stream-restart delay under
//! controlled, artificially injected fault conditions.
//!
//! Every sample written carries a self-describing sequence tag, so the capture
//! side can reconstruct, with no side channel, whether incoming data is
//! valid, silent or corrupted, and detect sequence discontinuities. A
//! single-threaded event dispatcher drives the test cases through their
//! lifecycle: steady-state I/O, fault injection, recovery, stop/restart.
//!
//! Device enumeration, hardware parameter negotiation, CLI parsing and config
//! loading stay outside this crate; it only needs an opaque stream handle
//! implementing [`stream::transport::PcmStream`].

pub mod harness;
pub mod stats;
pub mod stream;

pub use harness::reactor::{ControlMsg, EventDispatcher, Reactor};
pub use harness::{capture::CaptureTest, loopback::LoopbackDelayTest, playback::PlaybackTest};
pub use stats::aggregate::{Aggregator, RunSummary};
pub use stream::endpoint::StreamEndpoint;
pub use stream::sequence::FrameSequencer;
pub use stream::transport::{PcmStream, StreamConfig, StreamError};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate for the generated test streams
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default period size in frames (one read/write per period)
pub const DEFAULT_PERIOD_FRAMES: usize = 960;

/// Default buffer depth in periods
pub const DEFAULT_BUFFER_PERIODS: u32 = 4;
