//! Stream decoding using symphonia
//!
//! Opens a remote (or local) compressed-audio resource and produces a lazy
//! sequence of canonical stereo 44.1kHz i16 frames.
//!
//! The [`AudioDecoder`] trait is the codec capability seam: the mixer and the
//! engine only see `open(url) -> PcmStream`, so another codec can be added
//! without touching them. [`SymphoniaDecoder`] registers the MP3 codec only.

use crate::audio::resampler::StreamResampler;
use crate::audio::types::{f32_to_i16, AudioFrameBuffer, PcmFrame, SAMPLE_RATE};
use crate::error::{Error, Result};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecRegistry, Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

/// An open, ownership-exclusive decode context over one resource.
///
/// Not restartable: once it returns `Ok(None)` or an error, open a new one.
pub trait PcmStream {
    /// Next canonical frame, `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<PcmFrame>>;

    /// Resource this stream was opened from (for logging)
    fn url(&self) -> &str;
}

/// Upper bound for clips decoded into memory (10 minutes)
pub const MAX_CLIP_FRAMES: usize = SAMPLE_RATE as usize * 600;

/// Codec capability: opens a resource as a PCM frame stream.
pub trait AudioDecoder: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn PcmStream>>;

    /// Fully decode a finite resource into memory.
    fn decode_all(&self, url: &str) -> Result<AudioFrameBuffer> {
        collect_frames(self.open(url)?, url, MAX_CLIP_FRAMES)
    }
}

/// Fully decode a finite resource with an explicit frame limit.
///
/// Fails with `Decode` if the resource produces more than `max_frames`
/// frames (e.g. a live stream given where a clip was expected).
pub fn decode_to_buffer(
    decoder: &dyn AudioDecoder,
    url: &str,
    max_frames: usize,
) -> Result<AudioFrameBuffer> {
    collect_frames(decoder.open(url)?, url, max_frames)
}

fn collect_frames(
    mut stream: Box<dyn PcmStream>,
    url: &str,
    max_frames: usize,
) -> Result<AudioFrameBuffer> {
    let mut buffer = AudioFrameBuffer::new();

    while let Some(frame) = stream.next_frame()? {
        if buffer.len() >= max_frames {
            return Err(Error::Decode(format!(
                "{} exceeds the {} frame limit for in-memory clips",
                url, max_frames
            )));
        }
        buffer.push(frame);
    }

    debug!("Decoded {} into {} frames", url, buffer.len());
    Ok(buffer)
}

/// Codec registry with MP3 support only
fn get_codec_registry() -> &'static CodecRegistry {
    static CODEC_REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();
    CODEC_REGISTRY.get_or_init(|| {
        let mut registry = CodecRegistry::new();
        registry.register_all::<symphonia::default::codecs::MpaDecoder>();
        registry
    })
}

/// HTTP response body as a symphonia media source.
///
/// `MediaSource` requires `Sync`, so the response sits behind an
/// (uncontended) mutex. The body is read strictly forward.
struct HttpMediaSource {
    response: Mutex<reqwest::blocking::Response>,
    byte_len: Option<u64>,
}

impl Read for HttpMediaSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let response = self
            .response
            .get_mut()
            .map_err(|_| std::io::Error::other("http response lock poisoned"))?;
        response.read(buf)
    }
}

impl Seek for HttpMediaSource {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "http stream is not seekable",
        ))
    }
}

impl MediaSource for HttpMediaSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        self.byte_len
    }
}

/// MP3 decoder over HTTP(S) URLs and local files.
#[derive(Debug, Clone)]
pub struct SymphoniaDecoder {
    /// Connect and per-read timeout for HTTP sources
    timeout: Duration,
}

impl SymphoniaDecoder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Open the raw byte source and build a format hint for the probe.
    fn open_source(&self, url: &str) -> Result<(Box<dyn MediaSource>, Hint)> {
        let mut hint = Hint::new();

        if url.starts_with("http://") || url.starts_with("https://") {
            // Built per open: the blocking client must live on the calling
            // (non-async) thread
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(self.timeout)
                .timeout(self.timeout)
                .build()
                .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

            let response = client.get(url).send().map_err(|e| {
                Error::Connectivity(format!("Failed to open stream {}: {}", url, e))
            })?;

            if !response.status().is_success() {
                return Err(Error::Connectivity(format!(
                    "Stream {} answered HTTP {}",
                    url,
                    response.status()
                )));
            }

            let is_mpeg = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("mpeg") || ct.contains("mp3"))
                .unwrap_or(false);
            if is_mpeg || url_path_has_mp3_extension(url) {
                hint.with_extension("mp3");
            }

            let byte_len = response.content_length();
            let source = HttpMediaSource {
                response: Mutex::new(response),
                byte_len,
            };
            return Ok((Box::new(source), hint));
        }

        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Decode(format!("Failed to open file {}: {}", path.display(), e)))?;
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        Ok((Box::new(file), hint))
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn open(&self, url: &str) -> Result<Box<dyn PcmStream>> {
        debug!("Opening stream: {}", url);

        let (source, hint) = self.open_source(url)?;
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to probe format of {}: {}", url, e)))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode(format!("No audio track found in {}", url)))?;

        let track_id = track.id;
        let decoder = get_codec_registry()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Unsupported codec in {}: {}", url, e)))?;

        info!(
            "Opened {} (sample_rate={:?}, channels={:?})",
            url,
            track.codec_params.sample_rate,
            track.codec_params.channels.map(|c| c.count())
        );

        Ok(Box::new(SymphoniaStream {
            url: url.to_string(),
            format,
            decoder,
            track_id,
            resampler: None,
            pending: AudioFrameBuffer::with_capacity(4096),
            sample_buf: None,
            left: Vec::new(),
            right: Vec::new(),
            finished: false,
        }))
    }
}

fn url_path_has_mp3_extension(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".mp3")
}

/// Decode context produced by [`SymphoniaDecoder`].
struct SymphoniaStream {
    url: String,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    /// Present while the source rate differs from 44.1kHz
    resampler: Option<StreamResampler>,
    /// Decoded frames not yet handed out
    pending: AudioFrameBuffer,
    sample_buf: Option<SampleBuffer<f32>>,
    /// Planar scratch buffers reused across packets
    left: Vec<f32>,
    right: Vec<f32>,
    finished: bool,
}

impl SymphoniaStream {
    /// Decode packets until at least one frame is pending or the stream ends.
    fn decode_next_packet(&mut self) -> Result<()> {
        let packet = match self.format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!("Reached end of stream: {}", self.url);
                self.finish()?;
                return Ok(());
            }
            Err(SymphoniaError::IoError(e)) => {
                return Err(Error::Connectivity(format!(
                    "Read from {} failed: {}",
                    self.url, e
                )));
            }
            Err(e) => {
                return Err(Error::Decode(format!(
                    "Failed to read packet from {}: {}",
                    self.url, e
                )));
            }
        };

        // Skip packets for other tracks
        if packet.track_id() != self.track_id {
            return Ok(());
        }

        let decoded = match self.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                // Corrupt frames are common in MP3 streams
                warn!("Skipping undecodable packet in {}: {}", self.url, msg);
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Decode(format!("Decode error in {}: {}", self.url, e)));
            }
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 || decoded.frames() == 0 {
            return Ok(());
        }

        let needs_new_buf = self
            .sample_buf
            .as_ref()
            .map(|buf| buf.capacity() < decoded.capacity() * channels)
            .unwrap_or(true);
        if needs_new_buf {
            self.sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        let Some(sample_buf) = self.sample_buf.as_mut() else {
            return Ok(());
        };
        sample_buf.copy_interleaved_ref(decoded);

        // Split into stereo planes; mono duplicates, extra channels dropped
        self.left.clear();
        self.right.clear();
        for frame in sample_buf.samples().chunks_exact(channels) {
            let l = frame[0];
            let r = if channels > 1 { frame[1] } else { l };
            self.left.push(l);
            self.right.push(r);
        }

        self.push_planar(spec.rate)
    }

    /// Move the planar scratch buffers into `pending`, resampling if needed.
    fn push_planar(&mut self, rate: u32) -> Result<()> {
        if rate == SAMPLE_RATE {
            if let Some(mut old) = self.resampler.take() {
                old.flush(&mut self.pending)?;
            }
            self.pending.extend(
                self.left
                    .iter()
                    .zip(self.right.iter())
                    .map(|(&l, &r)| PcmFrame::from_stereo(f32_to_i16(l), f32_to_i16(r))),
            );
            return Ok(());
        }

        let rate_changed = self
            .resampler
            .as_ref()
            .map(|r| r.input_rate() != rate)
            .unwrap_or(true);
        if rate_changed {
            if let Some(mut old) = self.resampler.take() {
                old.flush(&mut self.pending)?;
            }
            self.resampler = Some(StreamResampler::new(rate)?);
        }

        if let Some(resampler) = self.resampler.as_mut() {
            resampler.process(&self.left, &self.right, &mut self.pending)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        if let Some(mut resampler) = self.resampler.take() {
            resampler.flush(&mut self.pending)?;
        }
        Ok(())
    }
}

impl PcmStream for SymphoniaStream {
    fn next_frame(&mut self) -> Result<Option<PcmFrame>> {
        loop {
            if let Some(frame) = self.pending.pop() {
                return Ok(Some(frame));
            }
            if self.finished {
                return Ok(None);
            }
            self.decode_next_packet()?;
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}
