//! Gain envelopes
//!
//! A [`GainEnvelope`] interpolates one source's volume multiplier from its
//! value at arm time to a target over a fixed number of frames. It has no
//! clock of its own: the mixer advances it once per mixed frame, so a fade
//! is sample-synchronous with the audio it scales.

use crate::audio::types::duration_to_frames;
use musique_common::FadeCurve;
use std::time::Duration;

/// Time-bounded interpolation of a volume multiplier.
///
/// `current` always lies in `[0.0, 1.0]`. Once `elapsed >= duration`,
/// `current == target` exactly and the envelope is inert until re-armed.
#[derive(Debug, Clone, PartialEq)]
pub struct GainEnvelope {
    current: f32,
    start: f32,
    target: f32,
    /// Frames advanced since arm
    elapsed: u64,
    /// Fade length in frames
    duration: u64,
    curve: FadeCurve,
}

impl GainEnvelope {
    /// Settled envelope holding `gain`.
    pub fn new(gain: f32) -> Self {
        Self::with_curve(gain, FadeCurve::Linear)
    }

    pub fn with_curve(gain: f32, curve: FadeCurve) -> Self {
        let gain = sanitize(gain);
        Self {
            current: gain,
            start: gain,
            target: gain,
            elapsed: 0,
            duration: 0,
            curve,
        }
    }

    /// Start a fade from the current value to `target` over `frames` frames.
    ///
    /// Re-arming mid-fade starts from wherever the previous fade had got to.
    /// A zero-length fade jumps straight to `target`.
    pub fn arm(&mut self, target: f32, frames: u64) {
        self.start = self.current;
        self.target = sanitize(target);
        self.elapsed = 0;
        self.duration = frames;

        if frames == 0 {
            self.current = self.target;
        }
    }

    /// [`arm`](Self::arm) with a wall-clock duration at 44.1kHz.
    pub fn arm_for(&mut self, target: f32, duration: Duration) {
        self.arm(target, duration_to_frames(duration));
    }

    /// Advance by one frame
    pub fn tick(&mut self) {
        self.advance(1);
    }

    /// Advance by `frames` frames.
    pub fn advance(&mut self, frames: u64) {
        if self.is_settled() {
            return;
        }

        self.elapsed = self.elapsed.saturating_add(frames).min(self.duration);

        if self.elapsed >= self.duration {
            self.current = self.target;
            return;
        }

        let progress = self.curve.shape(self.elapsed as f32 / self.duration as f32);
        self.current = (self.start + (self.target - self.start) * progress).clamp(0.0, 1.0);
    }

    pub fn is_settled(&self) -> bool {
        self.elapsed >= self.duration
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// Frames left until the envelope settles
    pub fn remaining(&self) -> u64 {
        self.duration - self.elapsed
    }
}

impl Default for GainEnvelope {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn sanitize(gain: f32) -> f32 {
    if gain.is_nan() {
        0.0
    } else {
        gain.clamp(0.0, 1.0)
    }
}
