//! Fakes shared by the integration tests
//!
//! - [`SyntheticDecoder`]: constant-amplitude streams instead of MP3 over HTTP
//! - [`CountingDevice`]: output device that counts opens, closes and frames
//! - [`ScriptedBackend`]: login/resolve that fails a set number of times
//! - [`FakePushConnector`]: push channel whose event sender tests can grab

#![allow(dead_code)]

use async_trait::async_trait;
use musique_agent::audio::{AudioDecoder, AudioDevice, DeviceHandle, OutputSpec, PcmFrame, PcmStream};
use musique_agent::engine::{Credentials, LoginClient, PushChannel, PushConnector, StreamResolver};
use musique_agent::events::AdEvent;
use musique_agent::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Amplitude of every main-stream sample
pub const MAIN_AMPLITUDE: i16 = 10_000;

/// Amplitude of every ad sample
pub const AD_AMPLITUDE: i16 = 8_000;

/// URL prefix that makes [`SyntheticDecoder::open`] fail
pub const FAILING_URL: &str = "fail://stream";

pub fn ad_url(name: &str) -> String {
    format!("http://ads.test/{}.mp3", name)
}

struct ConstantStream {
    url: String,
    sample: i16,
    remaining: Option<u64>,
}

impl PcmStream for ConstantStream {
    fn next_frame(&mut self) -> Result<Option<PcmFrame>> {
        match self.remaining.as_mut() {
            Some(0) => Ok(None),
            Some(n) => {
                *n -= 1;
                Ok(Some(PcmFrame::from_mono(self.sample)))
            }
            None => Ok(Some(PcmFrame::from_mono(self.sample))),
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Decoder producing constant-amplitude audio.
///
/// - URLs under `http://ads.test/` yield `ad_frames` frames of
///   [`AD_AMPLITUDE`] (an ad named `empty` yields none)
/// - URLs starting with [`FAILING_URL`] fail to open
/// - anything else yields [`MAIN_AMPLITUDE`], forever unless `main_frames`
///   is set, after failing the first `main_failures` opens
pub struct SyntheticDecoder {
    pub main_frames: Option<u64>,
    pub ad_frames: u64,
    /// Delay before an ad open returns, to keep the slot in Loading
    pub ad_delay: Duration,
    /// Main-stream opens still to fail
    pub main_failures: AtomicU32,
    pub opens: AtomicU32,
}

impl SyntheticDecoder {
    pub fn endless() -> Self {
        Self {
            main_frames: None,
            ad_frames: 44_100,
            ad_delay: Duration::ZERO,
            main_failures: AtomicU32::new(0),
            opens: AtomicU32::new(0),
        }
    }

    pub fn finite(main_frames: u64) -> Self {
        Self {
            main_frames: Some(main_frames),
            ..Self::endless()
        }
    }

    pub fn with_ad_frames(mut self, frames: u64) -> Self {
        self.ad_frames = frames;
        self
    }

    pub fn with_ad_delay(mut self, delay: Duration) -> Self {
        self.ad_delay = delay;
        self
    }

    pub fn with_main_failures(self, failures: u32) -> Self {
        self.main_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl AudioDecoder for SyntheticDecoder {
    fn open(&self, url: &str) -> Result<Box<dyn PcmStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if url.starts_with(FAILING_URL) {
            return Err(Error::Decode(format!("{}: not an MP3 stream", url)));
        }

        if url.starts_with("http://ads.test/") {
            if !self.ad_delay.is_zero() {
                std::thread::sleep(self.ad_delay);
            }
            let frames = if url.contains("/empty.") { 0 } else { self.ad_frames };
            return Ok(Box::new(ConstantStream {
                url: url.to_string(),
                sample: AD_AMPLITUDE,
                remaining: Some(frames),
            }));
        }

        let failing = self
            .main_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Decode(format!("{}: truncated MP3 header", url)));
        }

        Ok(Box::new(ConstantStream {
            url: url.to_string(),
            sample: MAIN_AMPLITUDE,
            remaining: self.main_frames,
        }))
    }
}

/// Counters shared between a [`CountingDevice`] and its handles
#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub opens: AtomicU32,
    pub closes: AtomicU32,
    pub drains: AtomicU32,
    pub frames: AtomicU64,
    /// Last frame written
    pub last: Mutex<Option<PcmFrame>>,
}

/// Output device that accepts everything, paced at roughly `pace` per write.
pub struct CountingDevice {
    pub counters: Arc<DeviceCounters>,
    pub pace: Duration,
    pub fail_open: AtomicBool,
}

impl CountingDevice {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(DeviceCounters::default()),
            pace: Duration::from_millis(1),
            fail_open: AtomicBool::new(false),
        }
    }

    pub fn opens(&self) -> u32 {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> u64 {
        self.counters.frames.load(Ordering::SeqCst)
    }

    pub fn last_frame(&self) -> Option<PcmFrame> {
        *self.counters.last.lock().unwrap()
    }

    /// Block until at least `frames` frames were written or `timeout` passes.
    pub fn wait_for_frames(&self, frames: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.frames() >= frames {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.frames() >= frames
    }
}

impl AudioDevice for CountingDevice {
    fn open(&self, _spec: &OutputSpec) -> Result<Box<dyn DeviceHandle>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Device("no such device".to_string()));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingHandle {
            counters: Arc::clone(&self.counters),
            pace: self.pace,
        }))
    }
}

struct CountingHandle {
    counters: Arc<DeviceCounters>,
    pace: Duration,
}

impl DeviceHandle for CountingHandle {
    fn write(&mut self, frames: &[PcmFrame]) -> Result<usize> {
        if !self.pace.is_zero() {
            std::thread::sleep(self.pace);
        }
        self.counters
            .frames
            .fetch_add(frames.len() as u64, Ordering::SeqCst);
        if let Some(last) = frames.last() {
            *self.counters.last.lock().unwrap() = Some(*last);
        }
        Ok(frames.len())
    }

    fn drain(&mut self) -> Result<()> {
        self.counters.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Login and stream lookup that fail with a connectivity error the first
/// `failures` times login is called.
pub struct ScriptedBackend {
    pub url: String,
    failures_left: AtomicU32,
    pub login_calls: AtomicU32,
    pub resolve_calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new(url: &str, failures: u32) -> Self {
        Self {
            url: url.to_string(),
            failures_left: AtomicU32::new(failures),
            login_calls: AtomicU32::new(0),
            resolve_calls: AtomicU32::new(0),
        }
    }

    pub fn login_calls(&self) -> u32 {
        self.login_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginClient for ScriptedBackend {
    async fn login(&self, _username: &str, _password: &str) -> Result<Credentials> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Connectivity("backend unreachable".to_string()));
        }
        Ok(Credentials::new("test-token"))
    }
}

#[async_trait]
impl StreamResolver for ScriptedBackend {
    async fn resolve_stream_url(&self, _token: &str) -> Result<String> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.url.clone())
    }
}

/// Push connector that hands the engine's event sender to the test.
#[derive(Default)]
pub struct FakePushConnector {
    sender: Mutex<Option<mpsc::Sender<AdEvent>>>,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl FakePushConnector {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Sender of the most recently opened channel
    pub fn sender(&self) -> Option<mpsc::Sender<AdEvent>> {
        self.sender.lock().unwrap().clone()
    }

    /// Drop the stored sender so the engine sees the channel go quiet
    pub fn hang_up(&self) {
        self.sender.lock().unwrap().take();
    }
}

#[async_trait]
impl PushConnector for FakePushConnector {
    async fn open(&self, _token: &str, events: mpsc::Sender<AdEvent>) -> Result<Box<dyn PushChannel>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.sender.lock().unwrap() = Some(events);
        Ok(Box::new(FakeChannel {
            closes: Arc::clone(&self.closes),
            closed: false,
        }))
    }
}

struct FakeChannel {
    closes: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl PushChannel for FakeChannel {
    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
