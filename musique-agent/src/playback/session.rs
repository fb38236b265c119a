//! Playback session
//!
//! One continuously-running decode → mix → output pipeline for one stream
//! URL, on a dedicated thread:
//!
//! 1. open the main stream
//! 2. open the output device ([`OutputSink`], closed exactly once)
//! 3. signal ready
//! 4. per frame: next main frame, ad tick, mix
//! 5. write batches to the device; when it is full, sleep briefly and
//!    re-check the stop flag
//!
//! The thread reports readiness and why it ended through oneshot channels
//! ([`SessionExit`]). A session that fails to open never signals ready.

use crate::audio::decoder::{AudioDecoder, PcmStream};
use crate::audio::output::{AudioDevice, OutputSink, OutputSpec};
use crate::audio::types::PcmFrame;
use crate::error::{Error, Result};
use crate::events::AdEvent;
use crate::playback::ad_injector::{AdDecision, AdInjector, AdInjectorHandle, AdSettings, AdState};
use crate::playback::mixer::{Mixer, SharedGains};
use musique_common::config::PlaybackConfig;
use musique_common::FadeCurve;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Frames mixed per device write
const BATCH_FRAMES: usize = 512;

/// Sleep while the device has no room
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(2);

/// Why a session's thread ended
#[derive(Debug)]
pub enum SessionExit {
    /// The main stream ended normally
    EndOfStream,
    /// `stop()` was requested
    Stopped,
    Failed(Error),
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionExit::EndOfStream => f.write_str("end of stream"),
            SessionExit::Stopped => f.write_str("stopped"),
            SessionExit::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Settings for one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub ads: AdSettings,
    pub fade_curve: FadeCurve,
    pub output: OutputSpec,
}

impl SessionSettings {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            ads: AdSettings::from_config(config),
            fade_curve: config.fade_curve,
            output: OutputSpec::canonical(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&PlaybackConfig::default())
    }
}

/// A running pipeline for one stream URL.
///
/// Owns the playback thread. Dropping the session stops it.
pub struct PlaybackSession {
    id: Uuid,
    url: String,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    ads: AdInjectorHandle,
    gains: SharedGains,
    ready_rx: Option<oneshot::Receiver<()>>,
    exit_rx: Option<oneshot::Receiver<SessionExit>>,
}

impl PlaybackSession {
    /// Spawn the playback thread for `url`.
    ///
    /// Stream and device are opened on the new thread. Success is signalled
    /// on [`take_ready`](Self::take_ready); failures are reported as
    /// [`SessionExit::Failed`] with no ready signal.
    pub fn start(
        url: &str,
        decoder: Arc<dyn AudioDecoder>,
        device: Arc<dyn AudioDevice>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let gains = SharedGains::default();
        let (injector, ads) = AdInjector::new(Arc::clone(&decoder), settings.ads.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let pipeline = Pipeline {
            session: id,
            url: url.to_string(),
            decoder,
            device,
            injector,
            mixer: Mixer::with_shared(settings.fade_curve, gains.clone()),
            output: settings.output,
            stop_flag: Arc::clone(&stop_flag),
            ready: Some(ready_tx),
        };

        let thread_ads = ads.clone();
        let thread = std::thread::Builder::new()
            .name("musique-playback".to_string())
            .spawn(move || {
                let exit = pipeline.run();
                thread_ads.shutdown();
                // Receiver may already be gone
                let _ = exit_tx.send(exit);
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn playback thread: {}", e)))?;

        info!(session = %id, url = %url, "Playback session started");

        Ok(Self {
            id,
            url: url.to_string(),
            stop_flag,
            thread: Some(thread),
            ads,
            gains,
            ready_rx: Some(ready_rx),
            exit_rx: Some(exit_rx),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Offer an ad to this session's injector.
    pub fn enqueue_ad(&self, event: AdEvent) -> AdDecision {
        if self.stop_flag.load(Ordering::Acquire) {
            return AdDecision::Rejected("playback session is stopping".to_string());
        }
        self.ads.enqueue(event)
    }

    pub fn ad_state(&self) -> AdState {
        self.ads.state()
    }

    /// Live view of the mixer gains
    pub fn gains(&self) -> SharedGains {
        self.gains.clone()
    }

    /// Receiver resolved once the stream and device are open. Its sender is
    /// dropped unsent if opening fails. Can be taken once.
    pub fn take_ready(&mut self) -> Option<oneshot::Receiver<()>> {
        self.ready_rx.take()
    }

    /// Receiver resolved when the playback thread ends. Can be taken once.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<SessionExit>> {
        self.exit_rx.take()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop decoding, drain and close the device, and join the thread.
    ///
    /// Blocks for at most one network read timeout. Idempotent.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        self.ads.shutdown();

        if let Some(thread) = self.thread.take() {
            debug!(session = %self.id, "Waiting for playback thread");
            if thread.join().is_err() {
                error!(session = %self.id, "Playback thread panicked");
            }
            info!(session = %self.id, "Playback session stopped");
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the playback thread
struct Pipeline {
    session: Uuid,
    url: String,
    decoder: Arc<dyn AudioDecoder>,
    device: Arc<dyn AudioDevice>,
    injector: AdInjector,
    mixer: Mixer,
    output: OutputSpec,
    stop_flag: Arc<AtomicBool>,
    ready: Option<oneshot::Sender<()>>,
}

impl Pipeline {
    fn run(mut self) -> SessionExit {
        let exit = match self.stream_to_device() {
            Ok(exit) => exit,
            Err(e) => SessionExit::Failed(e),
        };

        match &exit {
            SessionExit::Failed(e) => {
                warn!(session = %self.session, url = %self.url, "Playback session failed: {}", e)
            }
            other => info!(session = %self.session, url = %self.url, "Playback session ended: {}", other),
        }
        exit
    }

    fn stream_to_device(&mut self) -> Result<SessionExit> {
        let mut stream = self.decoder.open(&self.url)?;
        let mut sink = OutputSink::open(self.device.as_ref(), &self.output)?;

        if let Some(ready) = self.ready.take() {
            debug!(session = %self.session, "Stream and device open");
            // Receiver may already be gone
            let _ = ready.send(());
        }

        let mut batch = Vec::with_capacity(BATCH_FRAMES);
        loop {
            let end_of_stream = self.fill_batch(stream.as_mut(), &mut batch)?;

            if !self.write_all(&mut sink, &batch)? {
                sink.drain()?;
                sink.close()?;
                return Ok(SessionExit::Stopped);
            }

            if end_of_stream {
                sink.drain()?;
                sink.close()?;
                return Ok(SessionExit::EndOfStream);
            }
        }
    }

    /// Mix up to one batch. Returns true at end of stream.
    fn fill_batch(&mut self, stream: &mut dyn PcmStream, batch: &mut Vec<PcmFrame>) -> Result<bool> {
        batch.clear();

        while batch.len() < BATCH_FRAMES {
            if self.stopped() {
                return Ok(false);
            }

            let Some(main) = stream.next_frame()? else {
                return Ok(true);
            };
            let ad = self.injector.tick(&mut self.mixer);
            batch.push(self.mixer.mix_frame(main, ad));
        }

        Ok(false)
    }

    /// Write the whole batch, waiting out backpressure.
    ///
    /// Returns false if stopped before the batch was fully accepted.
    fn write_all(&self, sink: &mut OutputSink, batch: &[PcmFrame]) -> Result<bool> {
        let mut written = 0;

        while written < batch.len() {
            if self.stopped() {
                return Ok(false);
            }

            let accepted = sink.write(&batch[written..])?;
            if accepted == 0 {
                std::thread::sleep(BACKPRESSURE_SLEEP);
            }
            written += accepted;
        }

        Ok(!self.stopped())
    }

    fn stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }
}
