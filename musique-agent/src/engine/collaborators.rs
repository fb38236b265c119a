//! Collaborator interfaces used by the engine
//!
//! The engine never talks to the backend, the push service or the audio
//! hardware directly. Production implementations live in
//! [`crate::connectivity`] and [`crate::audio`]; tests substitute fakes.

use crate::error::Result;
use crate::events::AdEvent;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Result of a successful login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    /// Token lifetime in seconds, when the backend reports it
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in: None,
            refresh_token: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Exchanges a username and password for an access token.
#[async_trait]
pub trait LoginClient: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials>;
}

/// Looks up the URL of the stream to play.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve_stream_url(&self, token: &str) -> Result<String>;
}

/// An open push channel. Delivers events until closed.
#[async_trait]
pub trait PushChannel: Send {
    /// Disconnect. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Opens push channels that deliver [`AdEvent`]s.
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Resolves once the channel is ready to deliver events on `events`.
    async fn open(&self, token: &str, events: mpsc::Sender<AdEvent>) -> Result<Box<dyn PushChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_tokens() {
        let mut creds = Credentials::new("secret-token");
        creds.refresh_token = Some("also-secret".to_string());

        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-token"));
        assert!(!debug.contains("also-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
