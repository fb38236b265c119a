//! Advertisement overlay
//!
//! Owns the single ad slot and drives the main/ad gain envelopes around each
//! ad. State machine:
//!
//! ```text
//! Empty ─event─▶ Loading ─ready─▶ Armed ─first frame─▶ Playing
//!   ▲               │                                     │
//!   │            failure                              exhausted
//!   │               ▼                                     ▼
//!   └─────────── Empty ◀──────── restore settled ─── Draining
//! ```
//!
//! # Threads
//!
//! - [`AdInjectorHandle`] (any thread): accepts events, starts loads
//! - loader thread (one per ad): blocking fetch and decode into memory
//! - [`AdInjector`] (playback thread): picks up the finished buffer on its
//!   next tick and hands ad frames to the mixer
//!
//! The loader publishes its result into a mutex-protected slot and then sets
//! an atomic ready flag (Release). The playback tick only takes the lock
//! after seeing the flag (Acquire), so it never waits on a load.

use crate::audio::decoder::{decode_to_buffer, AudioDecoder, MAX_CLIP_FRAMES};
use crate::audio::types::{AudioFrameBuffer, PcmFrame};
use crate::error::{Error, Result};
use crate::events::AdEvent;
use crate::playback::mixer::Mixer;
use musique_common::config::PlaybackConfig;
use musique_common::AdPolicy;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ad slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdState {
    Empty = 0,
    /// Loader thread is fetching and decoding
    Loading = 1,
    /// Buffer installed and duck fade armed, nothing mixed yet
    Armed = 2,
    Playing = 3,
    /// Ad exhausted, restore fade in progress
    Draining = 4,
}

impl AdState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AdState::Loading,
            2 => AdState::Armed,
            3 => AdState::Playing,
            4 => AdState::Draining,
            _ => AdState::Empty,
        }
    }
}

impl fmt::Display for AdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdState::Empty => "empty",
            AdState::Loading => "loading",
            AdState::Armed => "armed",
            AdState::Playing => "playing",
            AdState::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Outcome of offering an [`AdEvent`] to the injector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdDecision {
    /// Loading started
    Accepted,
    /// Waiting behind the ad in flight
    Queued,
    Rejected(String),
}

impl AdDecision {
    pub fn is_rejected(&self) -> bool {
        matches!(self, AdDecision::Rejected(_))
    }
}

/// Ad overlay settings
#[derive(Debug, Clone, PartialEq)]
pub struct AdSettings {
    /// Main gain while an ad plays
    pub duck_level: f32,
    /// Length of the duck and restore fades
    pub fade: Duration,
    pub policy: AdPolicy,
    /// Waiting events kept under [`AdPolicy::Queue`]
    pub queue_capacity: usize,
    /// Longest ad accepted, in frames
    pub max_frames: usize,
}

impl AdSettings {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            duck_level: config.duck_level,
            fade: config.fade_duration(),
            policy: config.ad_policy,
            queue_capacity: config.ad_queue_capacity,
            max_frames: MAX_CLIP_FRAMES,
        }
    }
}

impl Default for AdSettings {
    fn default() -> Self {
        Self::from_config(&PlaybackConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event bookkeeping, guarded by `Shared::slot`
#[derive(Debug, Default)]
struct Slot {
    queue: VecDeque<AdEvent>,
    closed: bool,
}

struct Shared {
    /// [`AdState`] as u8. Empty → Loading and leaving Draining/Loading for
    /// Empty happen under the `slot` lock.
    state: AtomicU8,
    ready: AtomicBool,
    loaded: Mutex<Option<Result<AudioFrameBuffer>>>,
    slot: Mutex<Slot>,
    decoder: Arc<dyn AudioDecoder>,
    settings: AdSettings,
}

impl Shared {
    fn state(&self) -> AdState {
        AdState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AdState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Start loading `event`. Caller holds the slot lock.
    fn begin_load(shared: &Arc<Shared>, event: AdEvent) -> bool {
        shared.set_state(AdState::Loading);

        let loader = Arc::clone(shared);
        let url = event.url.clone();
        let spawned = std::thread::Builder::new()
            .name("musique-ad-loader".to_string())
            .spawn(move || loader.load(event));

        match spawned {
            Ok(_) => {
                info!(url = %url, "Loading ad");
                true
            }
            Err(e) => {
                warn!(url = %url, "Failed to spawn ad loader: {}", e);
                shared.set_state(AdState::Empty);
                false
            }
        }
    }

    /// Loader thread body
    fn load(&self, event: AdEvent) {
        let result = decode_to_buffer(self.decoder.as_ref(), &event.url, self.settings.max_frames)
            .and_then(|buffer| {
                if buffer.is_empty() {
                    Err(Error::Decode(format!("{} contains no audio", event.url)))
                } else {
                    Ok(buffer)
                }
            });

        let slot = lock(&self.slot);
        if slot.closed {
            debug!(url = %event.url, "Discarding ad loaded after shutdown");
            return;
        }

        *lock(&self.loaded) = Some(result);
        self.ready.store(true, Ordering::Release);
        drop(slot);
    }
}

/// Thread-safe entry point for ad events.
#[derive(Clone)]
pub struct AdInjectorHandle {
    shared: Arc<Shared>,
}

impl AdInjectorHandle {
    /// Offer an ad event.
    ///
    /// Loading starts immediately when the slot is empty. Otherwise the
    /// event is rejected or queued according to the configured policy; the
    /// ad in flight and the gains are left untouched either way.
    pub fn enqueue(&self, event: AdEvent) -> AdDecision {
        let mut slot = lock(&self.shared.slot);

        if slot.closed {
            return AdDecision::Rejected("playback session is shutting down".to_string());
        }

        let state = self.shared.state();
        if state == AdState::Empty {
            return if Shared::begin_load(&self.shared, event) {
                AdDecision::Accepted
            } else {
                AdDecision::Rejected("failed to start ad loader".to_string())
            };
        }

        match self.shared.settings.policy {
            AdPolicy::Reject => {
                info!(url = %event.url, %state, "Ignoring ad event, another ad is in flight");
                AdDecision::Rejected(format!("an ad is already {}", state))
            }
            AdPolicy::Queue => {
                if slot.queue.len() >= self.shared.settings.queue_capacity {
                    warn!(url = %event.url, "Ad queue full, dropping event");
                    return AdDecision::Rejected("ad queue is full".to_string());
                }
                info!(url = %event.url, position = slot.queue.len() + 1, "Queued ad event");
                slot.queue.push_back(event);
                AdDecision::Queued
            }
        }
    }

    pub fn state(&self) -> AdState {
        self.shared.state()
    }

    /// Events waiting behind the current ad
    pub fn queued(&self) -> usize {
        lock(&self.shared.slot).queue.len()
    }

    /// Refuse further events, drop queued ones and discard loads still in
    /// flight when they complete.
    pub fn shutdown(&self) {
        let mut slot = lock(&self.shared.slot);
        if !slot.closed {
            slot.closed = true;
            slot.queue.clear();
            debug!("Ad injector shut down");
        }
    }
}

/// Playback-thread side of the ad slot.
pub struct AdInjector {
    shared: Arc<Shared>,
    buffer: Option<AudioFrameBuffer>,
    /// Ad frames mixed for the current ad
    played: u64,
}

impl AdInjector {
    pub fn new(decoder: Arc<dyn AudioDecoder>, settings: AdSettings) -> (Self, AdInjectorHandle) {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(AdState::Empty as u8),
            ready: AtomicBool::new(false),
            loaded: Mutex::new(None),
            slot: Mutex::new(Slot::default()),
            decoder,
            settings,
        });

        let handle = AdInjectorHandle {
            shared: Arc::clone(&shared),
        };
        let injector = Self {
            shared,
            buffer: None,
            played: 0,
        };
        (injector, handle)
    }

    pub fn handle(&self) -> AdInjectorHandle {
        AdInjectorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> AdState {
        self.shared.state()
    }

    /// Advance the slot by one frame.
    ///
    /// Returns the ad frame to mix this tick, if any. Arms the mixer's duck
    /// fade when a loaded ad is installed and the restore fade when it runs
    /// out.
    pub fn tick(&mut self, mixer: &mut Mixer) -> Option<PcmFrame> {
        match self.shared.state() {
            AdState::Empty => None,
            AdState::Loading => {
                if !self.shared.ready.load(Ordering::Acquire) {
                    return None;
                }
                self.install(mixer);
                if self.shared.state() == AdState::Armed {
                    self.next_frame(mixer)
                } else {
                    None
                }
            }
            AdState::Armed | AdState::Playing => self.next_frame(mixer),
            AdState::Draining => {
                if mixer.is_settled() {
                    debug!("Restore fade complete");
                    self.finish_cycle();
                }
                None
            }
        }
    }

    fn install(&mut self, mixer: &mut Mixer) {
        self.shared.ready.store(false, Ordering::Relaxed);
        let loaded = lock(&self.shared.loaded).take();

        match loaded {
            Some(Ok(buffer)) => {
                info!(
                    frames = buffer.len(),
                    duration_ms = buffer.duration().as_millis() as u64,
                    "Ad ready, ducking main stream"
                );
                self.buffer = Some(buffer);
                self.played = 0;
                mixer.duck(self.shared.settings.duck_level, self.shared.settings.fade);
                self.shared.set_state(AdState::Armed);
            }
            Some(Err(e)) => {
                warn!("Ad load failed: {}", e);
                self.finish_cycle();
            }
            None => self.finish_cycle(),
        }
    }

    fn next_frame(&mut self, mixer: &mut Mixer) -> Option<PcmFrame> {
        let frame = self.buffer.as_mut().and_then(AudioFrameBuffer::pop);

        match frame {
            Some(frame) => {
                if self.played == 0 {
                    debug!("First ad frame mixed");
                    self.shared.set_state(AdState::Playing);
                }
                self.played += 1;
                Some(frame)
            }
            None => {
                info!(frames = self.played, "Ad finished, restoring main stream");
                self.buffer = None;
                mixer.restore(self.shared.settings.fade);
                self.shared.set_state(AdState::Draining);
                None
            }
        }
    }

    /// Return the slot to Empty, or start the next queued ad.
    fn finish_cycle(&mut self) {
        let mut slot = lock(&self.shared.slot);

        if !slot.closed {
            while let Some(next) = slot.queue.pop_front() {
                if Shared::begin_load(&self.shared, next) {
                    return;
                }
            }
        }

        self.shared.set_state(AdState::Empty);
    }
}
