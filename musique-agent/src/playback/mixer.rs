//! Two-source mixer with per-source gain envelopes
//!
//! Sums the main stream and the (optional) ad stream, each scaled by its
//! current gain, and saturates the result to 16 bits.
//!
//! # Architecture
//!
//! - [`mix`]: pure per-frame arithmetic
//! - [`Mixer`]: owns the main and ad [`GainEnvelope`]s and advances them
//!   once per mixed frame
//! - [`SharedGains`]: lock-free view of the current gains for other threads

use crate::audio::types::{clamp16, PcmFrame};
use crate::playback::envelope::GainEnvelope;
use musique_common::FadeCurve;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Mix one frame of each source.
///
/// Per channel: `clamp16(main * main_gain + ad * ad_gain)`.
#[inline]
pub fn mix(main: PcmFrame, main_gain: f32, ad: PcmFrame, ad_gain: f32) -> PcmFrame {
    PcmFrame {
        left: clamp16(main.left as f32 * main_gain + ad.left as f32 * ad_gain),
        right: clamp16(main.right as f32 * main_gain + ad.right as f32 * ad_gain),
    }
}

/// Current mixer gains, readable from any thread.
///
/// Values are stored as f32 bit patterns; the playback thread publishes with
/// Release and readers load with Acquire.
#[derive(Debug, Clone)]
pub struct SharedGains {
    inner: Arc<GainCells>,
}

#[derive(Debug)]
struct GainCells {
    main: AtomicU32,
    ad: AtomicU32,
}

impl SharedGains {
    pub fn new(main: f32, ad: f32) -> Self {
        Self {
            inner: Arc::new(GainCells {
                main: AtomicU32::new(main.to_bits()),
                ad: AtomicU32::new(ad.to_bits()),
            }),
        }
    }

    pub fn publish(&self, main: f32, ad: f32) {
        self.inner.main.store(main.to_bits(), Ordering::Release);
        self.inner.ad.store(ad.to_bits(), Ordering::Release);
    }

    pub fn main(&self) -> f32 {
        f32::from_bits(self.inner.main.load(Ordering::Acquire))
    }

    pub fn ad(&self) -> f32 {
        f32::from_bits(self.inner.ad.load(Ordering::Acquire))
    }
}

impl Default for SharedGains {
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}

/// Main/ad mixer.
///
/// At rest the main gain is 1.0 and the ad gain is 0.0.
#[derive(Debug)]
pub struct Mixer {
    main: GainEnvelope,
    ad: GainEnvelope,
    shared: SharedGains,
}

impl Mixer {
    pub fn new(curve: FadeCurve) -> Self {
        Self::with_shared(curve, SharedGains::default())
    }

    /// Mixer publishing its gains to an existing [`SharedGains`].
    pub fn with_shared(curve: FadeCurve, shared: SharedGains) -> Self {
        let mixer = Self {
            main: GainEnvelope::with_curve(1.0, curve),
            ad: GainEnvelope::with_curve(0.0, curve),
            shared,
        };
        mixer.publish();
        mixer
    }

    /// Mix one frame with the current gains, then advance both envelopes.
    ///
    /// `None` means no ad frame is available this tick (treated as silence).
    pub fn mix_frame(&mut self, main: PcmFrame, ad: Option<PcmFrame>) -> PcmFrame {
        let out = mix(
            main,
            self.main.current(),
            ad.unwrap_or_default(),
            self.ad.current(),
        );

        if !self.is_settled() {
            self.main.tick();
            self.ad.tick();
            self.publish();
        }

        out
    }

    /// Fade the main source down to `level` and the ad source up to full.
    pub fn duck(&mut self, level: f32, duration: Duration) {
        debug!("Ducking main to {:.2} over {:?}", level, duration);
        self.main.arm_for(level, duration);
        self.ad.arm_for(1.0, duration);
        self.publish();
    }

    /// Fade the main source back to full and the ad source out.
    pub fn restore(&mut self, duration: Duration) {
        debug!("Restoring main over {:?}", duration);
        self.main.arm_for(1.0, duration);
        self.ad.arm_for(0.0, duration);
        self.publish();
    }

    /// Both envelopes have reached their targets
    pub fn is_settled(&self) -> bool {
        self.main.is_settled() && self.ad.is_settled()
    }

    pub fn main_gain(&self) -> f32 {
        self.main.current()
    }

    pub fn ad_gain(&self) -> f32 {
        self.ad.current()
    }

    pub fn main_envelope(&self) -> &GainEnvelope {
        &self.main
    }

    pub fn ad_envelope(&self) -> &GainEnvelope {
        &self.ad
    }

    pub fn shared(&self) -> SharedGains {
        self.shared.clone()
    }

    fn publish(&self) {
        self.shared.publish(self.main.current(), self.ad.current());
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new(FadeCurve::Linear)
    }
}
