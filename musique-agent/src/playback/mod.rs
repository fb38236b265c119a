//! Playback: gain envelopes, mixing, ad overlay and the session loop

pub mod ad_injector;
pub mod envelope;
pub mod mixer;
pub mod session;

pub use ad_injector::{AdDecision, AdInjector, AdInjectorHandle, AdSettings, AdState};
pub use envelope::GainEnvelope;
pub use mixer::{mix, Mixer, SharedGains};
pub use session::{PlaybackSession, SessionExit, SessionSettings};
