//! Core audio data types
//!
//! Defines the canonical PCM frame and the frame queue used throughout the
//! audio pipeline.
//!
//! **Format:**
//! - Samples are signed 16-bit integers
//! - Always stereo: one `PcmFrame` is one left/right pair (4 bytes)
//! - Sample rate is always 44100 Hz after decoding

use std::collections::VecDeque;
use std::time::Duration;

/// Canonical sample rate for every frame in the pipeline
pub const SAMPLE_RATE: u32 = 44_100;

/// Canonical channel count
pub const CHANNELS: u16 = 2;

/// Canonical bit depth
pub const BIT_DEPTH: u16 = 16;

/// Bytes per stereo frame (2 channels × 2 bytes)
pub const BYTES_PER_FRAME: usize = 4;

/// Saturate a mixed sample value to the signed 16-bit range.
///
/// Rounds to nearest, then clamps to `[-32768, 32767]`. Overflow never wraps
/// to the opposite sign. NaN maps to silence.
pub fn clamp16(value: f32) -> i16 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert a normalized float sample (-1.0..=1.0) to i16 with saturation.
pub fn f32_to_i16(sample: f32) -> i16 {
    clamp16(sample * i16::MAX as f32)
}

/// Convert a frame count at the canonical rate into wall-clock time
pub fn frames_to_duration(frames: u64) -> Duration {
    Duration::from_micros(frames * 1_000_000 / SAMPLE_RATE as u64)
}

/// Convert wall-clock time into a frame count at the canonical rate
pub fn duration_to_frames(duration: Duration) -> u64 {
    (duration.as_micros() * SAMPLE_RATE as u128 / 1_000_000) as u64
}

/// PcmFrame represents one stereo sample period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcmFrame {
    /// Left channel sample
    pub left: i16,

    /// Right channel sample
    pub right: i16,
}

impl PcmFrame {
    /// Create a silent frame (0, 0)
    pub const fn silence() -> Self {
        PcmFrame { left: 0, right: 0 }
    }

    /// Create a frame from a mono sample (duplicate to both channels)
    pub const fn from_mono(sample: i16) -> Self {
        PcmFrame {
            left: sample,
            right: sample,
        }
    }

    /// Create a frame from left and right samples
    pub const fn from_stereo(left: i16, right: i16) -> Self {
        PcmFrame { left, right }
    }

    /// Little-endian byte layout: L lo, L hi, R lo, R hi
    pub fn to_le_bytes(self) -> [u8; BYTES_PER_FRAME] {
        let l = self.left.to_le_bytes();
        let r = self.right.to_le_bytes();
        [l[0], l[1], r[0], r[1]]
    }
}

/// Queue of decoded stereo frames.
///
/// Pure data structure: the decoder pushes frames as packets are decoded and
/// consumers pop them in order.
#[derive(Debug, Clone, Default)]
pub struct AudioFrameBuffer {
    frames: VecDeque<PcmFrame>,
}

impl AudioFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(frames: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(frames),
        }
    }

    pub fn push(&mut self, frame: PcmFrame) {
        self.frames.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<PcmFrame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Duration of the queued audio at the canonical rate
    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames.len() as u64)
    }

    /// Append interleaved samples with the given channel count.
    ///
    /// Mono input is upmixed by duplication. Input with more than two
    /// channels keeps its first two. A trailing partial frame is ignored.
    pub fn extend_interleaved(&mut self, samples: &[i16], channels: usize) {
        match channels {
            0 => {}
            1 => self
                .frames
                .extend(samples.iter().map(|&s| PcmFrame::from_mono(s))),
            n => self.frames.extend(
                samples
                    .chunks_exact(n)
                    .map(|chunk| PcmFrame::from_stereo(chunk[0], chunk[1])),
            ),
        }
    }

    /// Consume the queue into a contiguous vector (oldest first)
    pub fn into_vec(self) -> Vec<PcmFrame> {
        self.frames.into()
    }
}

impl Extend<PcmFrame> for AudioFrameBuffer {
    fn extend<I: IntoIterator<Item = PcmFrame>>(&mut self, iter: I) {
        self.frames.extend(iter);
    }
}

impl FromIterator<PcmFrame> for AudioFrameBuffer {
    fn from_iter<I: IntoIterator<Item = PcmFrame>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}
