//! Shared scripted mock transport for the integration suites.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};

use streamtester::stream::sequence::{CHANNEL_MASK, SEQ_MASK, SEQ_SHIFT};
use streamtester::stream::transport::{Direction, PcmStream, Readiness, StreamError};

/// Install a fmt subscriber honoring RUST_LOG, once per test binary.
pub fn init_logs() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Encode one tagged sample the way the playback sequencer does.
pub fn sample(ch: usize, tag: u16) -> i16 {
    ((ch as u16 & CHANNEL_MASK) | ((tag & SEQ_MASK) << SEQ_SHIFT)) as i16
}

/// A valid tagged period starting at sequence number `start`.
pub fn tagged_period(frames: usize, channels: usize, start: u16) -> Vec<i16> {
    let mut data = Vec::with_capacity(frames * channels);
    for f in 0..frames {
        let tag = (start + f as u16) & SEQ_MASK;
        for ch in 0..channels {
            data.push(sample(ch, tag));
        }
    }
    data
}

/// Like `tagged_period`, but with one sequence bit flipped in every frame.
pub fn corrupted_period(frames: usize, channels: usize, start: u16) -> Vec<i16> {
    let mut data = tagged_period(frames, channels, start);
    for frame in data.chunks_exact_mut(channels) {
        frame[0] ^= 0x0400;
    }
    data
}

/// One scripted response to a `read` call.
pub enum ReadStep {
    Data(Vec<i16>),
    Err(StreamError),
}

/// Observable mock state shared with the test body.
#[derive(Default)]
pub struct MockState {
    pub frames_written: usize,
    /// Wall-clock instants of every successful write, for gap analysis
    pub write_times: Vec<Instant>,
    pub halted: bool,
    pub started: bool,
    pub read_script: VecDeque<ReadStep>,
    pub recovered: Vec<StreamError>,
    /// What `read` returns once the script runs out
    pub on_exhausted: Option<StreamError>,
}

/// Scripted in-memory transport stream driven through the public API.
pub struct MockStream {
    direction: Direction,
    state: Rc<RefCell<MockState>>,
    rx: Vec<Receiver<Readiness>>,
    tx: Sender<Readiness>,
}

impl MockStream {
    fn new(direction: Direction) -> (Self, Rc<RefCell<MockState>>) {
        let (tx, rx) = unbounded();
        let state = Rc::new(RefCell::new(MockState {
            on_exhausted: Some(StreamError::Unrecoverable),
            ..MockState::default()
        }));
        (
            Self {
                direction,
                state: Rc::clone(&state),
                rx: vec![rx],
                tx,
            },
            state,
        )
    }

    pub fn playback() -> (Self, Rc<RefCell<MockState>>) {
        Self::new(Direction::Playback)
    }

    pub fn capture() -> (Self, Rc<RefCell<MockState>>) {
        Self::new(Direction::Capture)
    }

    /// Sender half of the readiness descriptor.
    pub fn sender(&self) -> Sender<Readiness> {
        self.tx.clone()
    }

    /// Queue `n` readiness events up front.
    pub fn push_ready(&self, n: usize) {
        for _ in 0..n {
            self.tx.send(Readiness).unwrap();
        }
    }
}

impl PcmStream for MockStream {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn start(&mut self) -> Result<(), StreamError> {
        self.state.borrow_mut().started = true;
        Ok(())
    }

    fn halt(&mut self) -> Result<(), StreamError> {
        self.state.borrow_mut().halted = true;
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn recover(&mut self, err: StreamError) -> Result<(), StreamError> {
        self.state.borrow_mut().recovered.push(err);
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16], frames: usize) -> Result<usize, StreamError> {
        let mut state = self.state.borrow_mut();
        match state.read_script.pop_front() {
            Some(ReadStep::Data(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(frames)
            }
            Some(ReadStep::Err(e)) => Err(e),
            None => Err(state
                .on_exhausted
                .clone()
                .unwrap_or(StreamError::Unrecoverable)),
        }
    }

    fn write(&mut self, _buf: &[i16], frames: usize) -> Result<usize, StreamError> {
        let mut state = self.state.borrow_mut();
        state.frames_written += frames;
        state.write_times.push(Instant::now());
        Ok(frames)
    }

    fn readiness(&self) -> &[Receiver<Readiness>] {
        &self.rx
    }
}
