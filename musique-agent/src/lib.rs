//! # Musique background-music agent (musique-agent)
//!
//! Plays a company's background-music stream and overlays advertisement
//! clips on demand, ducking the music around each ad.
//!
//! **Architecture:** one decode → mix → output thread per stream
//! (symphonia + rubato + cpal), driven by an async connection engine that
//! logs in, opens the Socket.IO push channel and restarts playback after
//! failures.
//!
//! - [`audio`]: decoding, resampling, device output
//! - [`playback`]: gain envelopes, mixer, ad injector, playback session
//! - [`engine`]: connection/retry orchestration and collaborator traits
//! - [`connectivity`]: HTTP backend and Socket.IO push channel

pub mod audio;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod playback;

pub use engine::{Collaborators, Engine, EngineSettings};
pub use error::{Error, Result};
pub use events::{AdEvent, PlaybackState};
