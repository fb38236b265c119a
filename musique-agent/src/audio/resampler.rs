//! Audio resampling using rubato
//!
//! Converts decoded stereo audio to the canonical 44.1kHz rate. Network
//! streams arrive packet by packet, so the resampler buffers planar input and
//! feeds rubato in fixed-size chunks.

use crate::audio::types::{f32_to_i16, AudioFrameBuffer, PcmFrame, SAMPLE_RATE};
use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Input frames handed to rubato per call
const CHUNK_FRAMES: usize = 1024;

/// Zero-input passes allowed while draining the filter at end of stream
const MAX_DRAIN_PASSES: usize = 4;

/// Chunked stereo resampler to the canonical sample rate.
///
/// Output is aligned with the input: the filter's leading delay is dropped
/// and [`flush`](Self::flush) drains its tail, so N input frames yield
/// `N * 44100 / input_rate` output frames.
pub struct StreamResampler {
    inner: FastFixedIn<f32>,
    input_rate: u32,
    /// Planar input waiting for a full chunk: [left, right]
    pending: [Vec<f32>; 2],
    /// Input frames accepted so far
    frames_in: u64,
    /// Output frames emitted so far
    frames_out: u64,
    /// Leading filter-delay frames still to discard
    delay_left: usize,
}

impl StreamResampler {
    /// Create a resampler from `input_rate` to 44.1kHz.
    pub fn new(input_rate: u32) -> Result<Self> {
        if input_rate == 0 {
            return Err(Error::Decode("Source reports a sample rate of 0".to_string()));
        }

        debug!("Resampling from {}Hz to {}Hz", input_rate, SAMPLE_RATE);

        // FastFixedIn: good quality/performance tradeoff for a live stream
        let inner = FastFixedIn::<f32>::new(
            SAMPLE_RATE as f64 / input_rate as f64,
            1.0, // max_relative_ratio (no runtime changes)
            PolynomialDegree::Septic,
            CHUNK_FRAMES,
            2,
        )
        .map_err(|e| Error::Decode(format!("Failed to create resampler: {}", e)))?;
        let delay_left = inner.output_delay();

        Ok(Self {
            inner,
            input_rate,
            pending: [
                Vec::with_capacity(CHUNK_FRAMES * 2),
                Vec::with_capacity(CHUNK_FRAMES * 2),
            ],
            frames_in: 0,
            frames_out: 0,
            delay_left,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Output frames the input seen so far corresponds to
    fn expected_output(&self) -> u64 {
        self.frames_in * SAMPLE_RATE as u64 / self.input_rate as u64
    }

    /// Queue planar stereo input and emit every complete chunk into `output`.
    pub fn process(
        &mut self,
        left: &[f32],
        right: &[f32],
        output: &mut AudioFrameBuffer,
    ) -> Result<()> {
        let frames = left.len().min(right.len());
        self.pending[0].extend_from_slice(&left[..frames]);
        self.pending[1].extend_from_slice(&right[..frames]);
        self.frames_in += frames as u64;

        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }

            let chunk: [Vec<f32>; 2] = [
                self.pending[0].drain(..needed).collect(),
                self.pending[1].drain(..needed).collect(),
            ];

            let resampled = self
                .inner
                .process(&chunk[..], None)
                .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;

            self.emit(resampled, output, u64::MAX);
        }

        Ok(())
    }

    /// Resample the pending input and drain the filter (end of stream).
    pub fn flush(&mut self, output: &mut AudioFrameBuffer) -> Result<()> {
        let expected = self.expected_output();

        if !self.pending[0].is_empty() {
            let chunk: [Vec<f32>; 2] = [
                std::mem::take(&mut self.pending[0]),
                std::mem::take(&mut self.pending[1]),
            ];
            let resampled = self
                .inner
                .process_partial(Some(&chunk[..]), None)
                .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;
            self.emit(resampled, output, expected);
        }

        let mut passes = 0;
        while self.frames_out < expected && passes < MAX_DRAIN_PASSES {
            let tail = self
                .inner
                .process_partial(None::<&[Vec<f32>]>, None)
                .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;
            self.emit(tail, output, expected);
            passes += 1;
        }

        Ok(())
    }

    /// Interleave planar output into canonical frames, skipping the leading
    /// filter delay and stopping at `limit` total output frames.
    fn emit(&mut self, planar: Vec<Vec<f32>>, output: &mut AudioFrameBuffer, limit: u64) {
        if planar.len() < 2 {
            return;
        }

        let produced = planar[0].len().min(planar[1].len());
        let skip = self.delay_left.min(produced);
        self.delay_left -= skip;

        let room = limit.saturating_sub(self.frames_out);
        let take = ((produced - skip) as u64).min(room) as usize;
        self.frames_out += take as u64;

        output.extend(
            planar[0][skip..skip + take]
                .iter()
                .zip(planar[1][skip..skip + take].iter())
                .map(|(&l, &r)| PcmFrame::from_stereo(f32_to_i16(l), f32_to_i16(r))),
        );
    }
}
