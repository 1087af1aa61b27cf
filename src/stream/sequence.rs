//! Self-describing per-sample sequence tagging
//!
//! Every S16LE sample of frame `N` carries `(ch & CHANNEL_MASK) | ((N & SEQ_MASK) << SEQ_SHIFT)`,
//! with `ch` starting from zero for the first sample of the frame. A receiver
//! can therefore classify each incoming frame as valid, silent or corrupted
//! and detect sequence jumps without any side channel.
//!
//! Loudspeaker/microphone loopback hardware legitimately produces a few
//! corrupted or silent frames around stream start/stop. Short bursts under
//! [`HYSTERESIS_FRAMES`] are tolerated with a warning; sustained corruption is
//! counted as real data-integrity errors.

use std::rc::Rc;

use tracing::{error, info, warn};

use crate::stats::aggregate::Aggregator;
use crate::stream::transport::SampleFormat;

/// Channel index field: low 5 bits of each sample
pub const CHANNEL_MASK: u16 = 0x1F;

/// Sequence number field: 11 bits above the channel field
pub const SEQ_MASK: u16 = 0x7FF;

/// Shift applied to the sequence number inside each sample
pub const SEQ_SHIFT: u32 = 5;

/// Maximum channel count representable in the channel field
pub const MAX_CHANNELS: usize = (CHANNEL_MASK as usize) + 1;

/// Frames of a null/invalid burst tolerated before errors are counted
pub const HYSTERESIS_FRAMES: u32 = 3;

/// Invalid frames of one run dumped to the log before suppression
pub const DEFAULT_INVALID_LOG_LIMIT: u32 = 1;

/// Classification of the most recently processed frame group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceState {
    /// Every byte of the frame is uniformly 0x00 or uniformly 0xFF
    #[default]
    Null,
    /// At least one sample disagrees with the expected tag pattern
    Invalid,
    /// Every sample carries a consistent channel/sequence tag
    Valid,
}

/// Per-direction sequence generator and checker.
///
/// While `state` is [`SequenceState::Valid`], `frame_num` holds the next
/// expected (or next to emit) sequence number modulo [`SEQ_MASK`]; while it is
/// not, `frame_num` doubles as the length of the current null/invalid streak.
pub struct FrameSequencer {
    channels: usize,
    format: SampleFormat,
    frame_num: u32,
    state: SequenceState,
    prev_state: SequenceState,
    error_count: u64,
    /// Observed tag at the most recent transition into Valid, consumed by
    /// loopback delay measurement.
    resync_frame: u16,
    /// Frames of the current invalid run already dumped to the log
    invalid_dumped: u32,
    invalid_log_limit: u32,
    aggregator: Rc<Aggregator>,
}

impl FrameSequencer {
    /// Create a sequencer for `channels` interleaved channels.
    ///
    /// # Panics
    /// Panics if `channels` is zero or exceeds [`MAX_CHANNELS`].
    pub fn new(channels: usize, format: SampleFormat, aggregator: Rc<Aggregator>) -> Self {
        assert!(
            (1..=MAX_CHANNELS).contains(&channels),
            "channel count must fit the {}-bit tag field",
            CHANNEL_MASK.count_ones()
        );
        Self {
            channels,
            format,
            frame_num: 0,
            state: SequenceState::Null,
            prev_state: SequenceState::Null,
            error_count: 0,
            resync_frame: 0,
            invalid_dumped: 0,
            invalid_log_limit: DEFAULT_INVALID_LOG_LIMIT,
            aggregator,
        }
    }

    /// Current classification state.
    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Classification state before the most recent transition.
    pub fn prev_state(&self) -> SequenceState {
        self.prev_state
    }

    /// Sequence errors counted by this sequencer.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Observed tag at the most recent transition into Valid.
    pub fn resync_frame(&self) -> u16 {
        self.resync_frame
    }

    /// Number of interleaved channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Generate `frames` tagged frames into `buf`.
    ///
    /// Advances `frame_num` once per frame regardless of channel count.
    /// Unsupported sample formats are a no-op (extensibility stub).
    pub fn fill(&mut self, buf: &mut [i16], frames: usize) {
        match self.format {
            SampleFormat::S16Le => {
                for frame in buf.chunks_exact_mut(self.channels).take(frames) {
                    for (ch, sample) in frame.iter_mut().enumerate() {
                        *sample = encode_sample(ch, self.frame_num as u16);
                    }
                    self.frame_num = (self.frame_num + 1) & u32::from(SEQ_MASK);
                }
            }
            // format not implemented yet
            _ => {}
        }
    }

    /// Check `frames` received frames against the expected sequence.
    ///
    /// Returns the number of errors counted by this call. Every counted error
    /// is also rolled up into the shared [`Aggregator`].
    pub fn check(&mut self, buf: &[i16], frames: usize) -> u64 {
        if self.format != SampleFormat::S16Le {
            return 0;
        }
        let mut errors = 0u64;
        for frame in buf.chunks_exact(self.channels).take(frames) {
            let (next, seq) = classify_frame(frame);
            if next == self.state {
                errors += self.steady_frame(frame, next, seq);
            } else {
                errors += self.transition_frame(frame, next, seq);
                self.prev_state = self.state;
                self.state = next;
            }
        }
        errors
    }

    /// Frame whose classification matches the current state.
    fn steady_frame(&mut self, frame: &[i16], state: SequenceState, seq: u16) -> u64 {
        match state {
            SequenceState::Null => {
                self.frame_num += 1;
                0
            }
            SequenceState::Invalid => {
                self.frame_num += 1;
                if self.frame_num > HYSTERESIS_FRAMES {
                    if self.invalid_dumped < self.invalid_log_limit {
                        error!(
                            "invalid frame, corruption sustained for {} frames",
                            self.frame_num
                        );
                        dump_frame(frame, true);
                        self.invalid_dumped += 1;
                    }
                    self.count_error();
                    1
                } else {
                    0
                }
            }
            SequenceState::Valid => {
                let mut counted = 0;
                if self.frame_num != u32::from(seq) {
                    error!(
                        "frame 0x{:04x} received instead of 0x{:04x}",
                        seq, self.frame_num
                    );
                    self.count_error();
                    counted = 1;
                }
                // resync to the observed tag either way, so one jump does not
                // cascade into an error per following frame
                self.frame_num = u32::from((seq + 1) & SEQ_MASK);
                counted
            }
        }
    }

    /// Frame whose classification differs from the current state.
    fn transition_frame(&mut self, frame: &[i16], next: SequenceState, seq: u16) -> u64 {
        let streak = self.frame_num;
        match next {
            SequenceState::Invalid => {
                self.invalid_dumped = 0;
                let counted = match self.state {
                    // possibly a benign stream stop tearing the tail of the
                    // data, do not count yet
                    SequenceState::Valid => {
                        warn!("invalid frame while expecting frame 0x{:04x}", streak);
                        dump_frame(frame, false);
                        0
                    }
                    SequenceState::Null => {
                        if streak > HYSTERESIS_FRAMES {
                            error!("invalid frame after {} null frames", streak);
                            dump_frame(frame, true);
                            self.count_error();
                            1
                        } else {
                            warn!("invalid frame after {} null frames", streak);
                            dump_frame(frame, false);
                            0
                        }
                    }
                    SequenceState::Invalid => 0,
                };
                self.frame_num = 1;
                self.invalid_dumped = 1;
                counted
            }
            SequenceState::Null => {
                let pattern = if frame[0] == 0 { 0x00u8 } else { 0xFFu8 };
                let counted = match self.state {
                    SequenceState::Valid => {
                        warn!(
                            "null frame (0x{:02X}) while expecting frame 0x{:04x}",
                            pattern, streak
                        );
                        0
                    }
                    SequenceState::Invalid => {
                        if streak > HYSTERESIS_FRAMES {
                            error!(
                                "null frame (0x{:02X}) after {} invalid frames",
                                pattern, streak
                            );
                            self.count_error();
                            1
                        } else {
                            warn!(
                                "null frame (0x{:02X}) after {} invalid frames",
                                pattern, streak
                            );
                            0
                        }
                    }
                    SequenceState::Null => 0,
                };
                self.frame_num = 1;
                counted
            }
            SequenceState::Valid => {
                match self.state {
                    SequenceState::Null if streak > 0 => {
                        warn!("valid frame after {} null frames", streak);
                    }
                    SequenceState::Null => {
                        info!("first valid frame");
                    }
                    SequenceState::Invalid => {
                        warn!("valid frame after {} invalid frames", streak);
                        dump_frame(frame, false);
                    }
                    SequenceState::Valid => {}
                }
                // synchronization point: an external delay measurement reads
                // resync_frame to compute how many frames were lost
                self.resync_frame = seq;
                self.frame_num = u32::from((seq + 1) & SEQ_MASK);
                0
            }
        }
    }

    /// Reset before a deliberate discontinuity (injected xrun, forced
    /// restart) so the next gap is not counted as an error.
    pub fn notify_discontinuity(&mut self) {
        self.prev_state = self.state;
        self.state = SequenceState::Null;
        self.frame_num = 0;
        self.invalid_dumped = 0;
    }

    fn count_error(&mut self) {
        self.error_count += 1;
        self.aggregator.record_error();
    }
}

/// Encode one sample of frame `seq` for channel `ch`.
pub(crate) fn encode_sample(ch: usize, seq: u16) -> i16 {
    ((ch as u16 & CHANNEL_MASK) | ((seq & SEQ_MASK) << SEQ_SHIFT)) as i16
}

/// Classify one frame, returning its state and the decoded sequence tag of
/// its first sample (zero for null frames).
fn classify_frame(frame: &[i16]) -> (SequenceState, u16) {
    if frame.iter().all(|&s| s == 0) || frame.iter().all(|&s| s == -1) {
        return (SequenceState::Null, 0);
    }
    let seq = (frame[0] as u16) >> SEQ_SHIFT;
    for (ch, &sample) in frame.iter().enumerate() {
        let s = sample as u16;
        if usize::from(s & CHANNEL_MASK) != ch || (s >> SEQ_SHIFT) != seq {
            return (SequenceState::Invalid, seq);
        }
    }
    (SequenceState::Valid, seq)
}

/// Hex-dump one frame at warn or error severity.
fn dump_frame(frame: &[i16], as_error: bool) {
    let mut line = String::from(" ");
    for &sample in frame {
        line.push_str(&format!(" {:04x}", sample as u16));
    }
    if as_error {
        error!("{}", line);
    } else {
        warn!("{}", line);
    }
}
