//! Audio output using cpal
//!
//! The playback loop talks to the device through the [`AudioDevice`] /
//! [`DeviceHandle`] traits. Writes are non-blocking: a handle accepts as many
//! frames as it has room for and the caller retries with the rest.
//!
//! [`CpalDevice`] is the hardware implementation. Frames cross from the
//! playback thread to the cpal callback through a lock-free SPSC ring buffer;
//! the callback outputs silence on underrun instead of blocking.

use crate::audio::types::{PcmFrame, BIT_DEPTH, CHANNELS, SAMPLE_RATE};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use ringbuf::traits::{Consumer as _, Observer as _, Producer as _, Split as _};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Ring buffer size between the playback thread and the device callback
const RING_BUFFER_FRAMES: usize = 8192;

/// Upper bound on how long `drain` waits for queued frames to play
const DRAIN_TIMEOUT: Duration = Duration::from_millis(750);

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Output format requested from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl OutputSpec {
    /// 44.1kHz, stereo, 16-bit
    pub const fn canonical() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            bit_depth: BIT_DEPTH,
        }
    }
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self::canonical()
    }
}

/// An open output device.
///
/// Handles are created and used on the playback thread only.
pub trait DeviceHandle {
    /// Queue frames for playback without blocking.
    ///
    /// Returns how many leading frames of `frames` were accepted (possibly 0
    /// when the device is full).
    fn write(&mut self, frames: &[PcmFrame]) -> Result<usize>;

    /// Wait (bounded) until already-accepted frames have played.
    fn drain(&mut self) -> Result<()>;

    /// Release the device. Further writes fail.
    fn close(&mut self) -> Result<()>;
}

/// Factory for output handles.
pub trait AudioDevice: Send + Sync {
    fn open(&self, spec: &OutputSpec) -> Result<Box<dyn DeviceHandle>>;
}

/// Scoped ownership of an open device.
///
/// Closes the handle exactly once: on [`OutputSink::close`] or, failing
/// that, on drop.
pub struct OutputSink {
    handle: Option<Box<dyn DeviceHandle>>,
}

impl OutputSink {
    pub fn open(device: &dyn AudioDevice, spec: &OutputSpec) -> Result<Self> {
        let handle = device.open(spec)?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    pub fn write(&mut self, frames: &[PcmFrame]) -> Result<usize> {
        match self.handle.as_mut() {
            Some(handle) => handle.write(frames),
            None => Err(Error::Device("Output already closed".to_string())),
        }
    }

    pub fn drain(&mut self) -> Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.drain(),
            None => Ok(()),
        }
    }

    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(mut handle) => handle.close(),
            None => Ok(()),
        }
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!("Failed to close audio output: {}", e);
        }
    }
}

/// Audio output through the host's default audio API.
#[derive(Debug, Clone, Default)]
pub struct CpalDevice {
    /// Requested device name (None = default device)
    device_name: Option<String>,
}

impl CpalDevice {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    /// List available audio output devices.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();

        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::Device(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();

        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    /// Resolve the requested device, falling back to the default one.
    fn select_device(&self) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = self.device_name.as_ref() {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::Device(format!("Failed to enumerate devices: {}", e)))?;

            if let Some(dev) = devices.find(|d| d.name().ok().as_ref() == Some(name)) {
                info!("Found requested audio device: {}", name);
                return Ok(dev);
            }

            warn!(
                "Requested device '{}' not found, falling back to default device",
                name
            );
        }

        let dev = host
            .default_output_device()
            .ok_or_else(|| Error::Device("No default output device found".to_string()))?;
        info!(
            "Using default audio device: {}",
            dev.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        Ok(dev)
    }

    /// Pick a stream config at the requested rate.
    ///
    /// Prefers the requested channel count with i16 samples, then any sample
    /// format at that rate. The device must support the requested rate: the
    /// pipeline does not resample on output.
    fn get_best_config(device: &Device, spec: &OutputSpec) -> Result<(StreamConfig, SampleFormat)> {
        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| Error::Device(format!("Failed to get device configs: {}", e)))?
            .filter(|c| {
                c.min_sample_rate().0 <= spec.sample_rate && c.max_sample_rate().0 >= spec.sample_rate
            })
            .collect();

        let score = |c: &cpal::SupportedStreamConfigRange| {
            let channel_match = c.channels() == spec.channels;
            let format_match = c.sample_format() == SampleFormat::I16;
            (channel_match as u8) * 2 + format_match as u8
        };

        let best = supported
            .into_iter()
            .filter(|c| c.channels() >= 1)
            .max_by_key(|c| score(c))
            .ok_or_else(|| {
                Error::Device(format!(
                    "Device does not support {}Hz output",
                    spec.sample_rate
                ))
            })?;

        let sample_format = best.sample_format();
        let config = best
            .with_sample_rate(cpal::SampleRate(spec.sample_rate))
            .config();
        Ok((config, sample_format))
    }
}

impl AudioDevice for CpalDevice {
    fn open(&self, spec: &OutputSpec) -> Result<Box<dyn DeviceHandle>> {
        let device = self.select_device()?;
        let (config, sample_format) = Self::get_best_config(&device, spec)?;

        debug!(
            "Audio config: sample_rate={}, channels={}, format={:?}",
            config.sample_rate.0, config.channels, sample_format
        );

        let (producer, consumer) = HeapRb::<PcmFrame>::new(RING_BUFFER_FRAMES).split();
        let shared = Arc::new(CallbackShared::default());

        let stream = match sample_format {
            SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, &shared)?,
            SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer, &shared)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, consumer, &shared)?,
            sample_format => {
                return Err(Error::Device(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::Device(format!("Failed to start stream: {}", e)))?;

        info!("Audio stream started");
        Ok(Box::new(CpalHandle {
            stream: Some(stream),
            producer,
            shared,
        }))
    }
}

/// State shared with the device callback
#[derive(Debug, Default)]
struct CallbackShared {
    /// Set by the error callback; surfaced on the next write
    error: AtomicBool,
    underruns: AtomicU64,
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<PcmFrame>,
    shared: &Arc<CallbackShared>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<i16> + FromSample<f32>,
{
    let channels = config.channels as usize;
    let data_shared = Arc::clone(shared);
    let error_shared = Arc::clone(shared);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut starved = false;
                for out in data.chunks_mut(channels) {
                    let frame = match consumer.try_pop() {
                        Some(frame) => frame,
                        None => {
                            starved = true;
                            PcmFrame::silence()
                        }
                    };

                    if channels == 1 {
                        let mono = (frame.left as f32 + frame.right as f32) / (2.0 * 32_768.0);
                        out[0] = T::from_sample(mono);
                        continue;
                    }
                    out[0] = T::from_sample(frame.left);
                    out[1] = T::from_sample(frame.right);
                    for extra in out.iter_mut().skip(2) {
                        *extra = T::EQUILIBRIUM;
                    }
                }
                if starved {
                    data_shared.underruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| {
                error!("Audio stream error: {}", err);
                error_shared.error.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| Error::Device(format!("Failed to build stream: {}", e)))
}

struct CpalHandle {
    stream: Option<Stream>,
    producer: HeapProd<PcmFrame>,
    shared: Arc<CallbackShared>,
}

impl DeviceHandle for CpalHandle {
    fn write(&mut self, frames: &[PcmFrame]) -> Result<usize> {
        if self.stream.is_none() {
            return Err(Error::Device("Output already closed".to_string()));
        }
        if self.shared.error.load(Ordering::Acquire) {
            return Err(Error::Device("Audio stream reported an error".to_string()));
        }
        Ok(self.producer.push_slice(frames))
    }

    fn drain(&mut self) -> Result<()> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.producer.is_empty() {
            if Instant::now() >= deadline {
                debug!(
                    "Drain timed out with {} frames queued",
                    self.producer.occupied_len()
                );
                break;
            }
            if self.shared.error.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(DRAIN_POLL);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };

        info!(
            "Stopping audio stream ({} underrun callbacks)",
            self.shared.underruns.load(Ordering::Relaxed)
        );
        stream
            .pause()
            .map_err(|e| Error::Device(format!("Failed to pause stream: {}", e)))?;
        Ok(())
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
