//! Scripted stub transport for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::stream::sequence::encode_sample;
use crate::stream::transport::{Direction, PcmStream, Readiness, StreamError};

/// One scripted response to a `read` call.
pub(crate) enum ReadStep {
    /// A full period of sample data
    Data(Vec<i16>),
    /// A short read of this many frames (zero-filled)
    Short(usize),
    /// A one-shot error
    Err(StreamError),
}

impl ReadStep {
    /// A fully null period (all-zero bytes).
    pub fn null(frames: usize, channels: usize) -> Self {
        ReadStep::Data(vec![0i16; frames * channels])
    }

    /// A valid tagged period starting at sequence number `start`.
    pub fn tagged(frames: usize, channels: usize, start: u16) -> Self {
        let mut data = Vec::with_capacity(frames * channels);
        for f in 0..frames {
            let tag = (start + f as u16) & crate::stream::sequence::SEQ_MASK;
            for ch in 0..channels {
                data.push(encode_sample(ch, tag));
            }
        }
        ReadStep::Data(data)
    }

    /// Like `tagged`, but with one sequence bit flipped in every frame.
    pub fn corrupted(frames: usize, channels: usize, start: u16) -> Self {
        match Self::tagged(frames, channels, start) {
            ReadStep::Data(mut data) => {
                for frame in data.chunks_exact_mut(channels) {
                    frame[0] ^= 0x0400;
                }
                ReadStep::Data(data)
            }
            other => other,
        }
    }
}

/// Observable stub state shared with the test body.
pub(crate) struct StubState {
    pub frames_written: usize,
    pub halted: bool,
    pub prepared: bool,
    pub started: bool,
    /// Whether `recover` clears `write_error`
    pub recover_fixes: bool,
    /// Sticky error returned by every `write` until recovery clears it
    pub write_error: Option<StreamError>,
    /// One-shot error returned by the next `start`
    pub start_error: Option<StreamError>,
    pub read_script: VecDeque<ReadStep>,
    pub recovered: Vec<StreamError>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            frames_written: 0,
            halted: false,
            prepared: false,
            started: false,
            recover_fixes: true,
            write_error: None,
            start_error: None,
            read_script: VecDeque::new(),
            recovered: Vec::new(),
        }
    }
}

/// Scripted in-memory transport stream.
pub(crate) struct StubStream {
    direction: Direction,
    state: Rc<RefCell<StubState>>,
    rx: Vec<Receiver<Readiness>>,
    tx: Sender<Readiness>,
}

impl StubStream {
    fn new(direction: Direction) -> (Self, Rc<RefCell<StubState>>) {
        let (tx, rx) = unbounded();
        let state = Rc::new(RefCell::new(StubState::default()));
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

    pub fn playback() -> (Self, Rc<RefCell<StubState>>) {
        Self::new(Direction::Playback)
    }

    pub fn capture() -> (Self, Rc<RefCell<StubState>>) {
        Self::new(Direction::Capture)
    }

    /// A stream exposing `n` readiness descriptors, for rejection tests.
    pub fn with_descriptors(n: usize) -> Self {
        let (mut stream, _) = Self::new(Direction::Playback);
        stream.rx = (0..n).map(|_| unbounded().1).collect();
        stream
    }

    /// Sender half of the readiness descriptor.
    pub fn sender(&self) -> Sender<Readiness> {
        self.tx.clone()
    }
}

impl PcmStream for StubStream {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn start(&mut self) -> Result<(), StreamError> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.start_error.take() {
            return Err(e);
        }
        state.started = true;
        Ok(())
    }

    fn halt(&mut self) -> Result<(), StreamError> {
        self.state.borrow_mut().halted = true;
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), StreamError> {
        self.state.borrow_mut().prepared = true;
        Ok(())
    }

    fn recover(&mut self, err: StreamError) -> Result<(), StreamError> {
        let mut state = self.state.borrow_mut();
        state.recovered.push(err);
        if state.recover_fixes {
            state.write_error = None;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16], frames: usize) -> Result<usize, StreamError> {
        let step = self.state.borrow_mut().read_script.pop_front();
        match step {
            Some(ReadStep::Data(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(frames)
            }
            Some(ReadStep::Short(n)) => {
                buf.fill(0);
                Ok(n)
            }
            Some(ReadStep::Err(e)) => Err(e),
            // script exhausted: stop the run deterministically
            None => Err(StreamError::Unrecoverable),
        }
    }

    fn write(&mut self, _buf: &[i16], frames: usize) -> Result<usize, StreamError> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.write_error.clone() {
            return Err(e);
        }
        state.frames_written += frames;
        Ok(frames)
    }

    fn readiness(&self) -> &[Receiver<Readiness>] {
        &self.rx
    }
}
