//! Events and observable state for the agent
//!
//! # Architecture
//!
//! - **AdEvent**: push channel → Engine → AdInjector over a bounded
//!   `tokio::sync::mpsc` channel, consumed at most once
//! - **PlaybackState**: Engine → observers over `tokio::sync::watch`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Request to overlay an advertisement clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdEvent {
    /// Location of the clip (HTTP(S) URL or local path)
    pub url: String,

    /// When the push channel delivered the event
    pub received_at: DateTime<Utc>,
}

impl AdEvent {
    /// Event stamped with the current time
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            received_at: Utc::now(),
        }
    }
}

/// Engine connection/playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Not started, or stopped
    #[default]
    Idle,

    /// Logging in, opening the push channel or resolving the stream
    Connecting,

    /// A playback session is running
    Streaming,

    /// Stopped on an error that retrying cannot fix
    Faulted,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Connecting => "connecting",
            PlaybackState::Streaming => "streaming",
            PlaybackState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}
