//! Audio subsystem
//!
//! Decoding, resampling and device output for the canonical
//! 44.1kHz stereo i16 frame format.

pub mod decoder;
pub mod output;
pub mod resampler;
pub mod types;

pub use decoder::{decode_to_buffer, AudioDecoder, PcmStream, SymphoniaDecoder};
pub use output::{AudioDevice, CpalDevice, DeviceHandle, OutputSink, OutputSpec};
pub use resampler::StreamResampler;
pub use types::{clamp16, AudioFrameBuffer, PcmFrame, SAMPLE_RATE};
