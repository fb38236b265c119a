//! Error types for musique-agent
//!
//! Defines the agent's error taxonomy using thiserror. Each variant tells the
//! engine whether a retry can help (see [`Error::is_recoverable`]).

use thiserror::Error;

/// Main error type for musique-agent
#[derive(Error, Debug)]
pub enum Error {
    /// Network unreachable, timeout, or push channel failed to open
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Backend answered with a non-success response or an unusable body
    #[error("Request error: {0}")]
    Request(String),

    /// Malformed or unsupported audio payload
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output device unavailable or failed
    #[error("Audio output error: {0}")]
    Device(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Feature not yet implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// File or socket I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the engine should back off and try again after this error.
    ///
    /// Configuration problems and unimplemented modes cannot be fixed by
    /// retrying; everything else (network, backend, decode, device) can.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::NotImplemented(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::Connectivity(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

impl From<musique_common::Error> for Error {
    fn from(e: musique_common::Error) -> Self {
        match e {
            musique_common::Error::Io(io) => Error::Io(io),
            other => Error::Config(other.to_string()),
        }
    }
}

/// Convenience Result type using musique-agent Error
pub type Result<T> = std::result::Result<T, Error>;
