//! Backend REST client
//!
//! - `POST /api/auth` exchanges username/password for an access token
//! - `GET /api/company/stream` returns the company's stream URL

use crate::engine::collaborators::{Credentials, LoginClient, StreamResolver};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: AccessToken,
    #[serde(default)]
    refresh_token: Option<RefreshToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessToken {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RefreshToken {
    token: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    stream: String,
    #[serde(default)]
    cover: Option<String>,
}

/// Pull the playable URL out of the backend's `stream` field.
///
/// The field is either a bare URL or an embed snippet containing one; the
/// URL runs from the first `http` up to and including `.mp3` (or to the end
/// of the URL-like run when there is no `.mp3`).
pub fn extract_stream_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let start = raw.find("http")?;
    let rest = &raw[start..];

    let url = match rest.find(".mp3") {
        Some(end) => &rest[..end + ".mp3".len()],
        None => {
            let end = rest
                .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>'))
                .unwrap_or(rest.len());
            &rest[..end]
        }
    };

    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

/// reqwest-based backend client
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-success response into a `Request` error carrying its body.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Request(format!("HTTP {}: {}", status.as_u16(), body.trim())))
    }
}

#[async_trait]
impl LoginClient for HttpBackend {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials> {
        info!(phase = "login", username, "Logging in");

        let response = self
            .http_client
            .post(self.endpoint("/api/auth"))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let body: LoginResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Request(format!("Unexpected login response: {}", e)))?;

        debug!(expires_in = ?body.access_token.expires_in, "Login accepted");

        Ok(Credentials {
            access_token: body.access_token.token,
            expires_in: body.access_token.expires_in,
            refresh_token: body.refresh_token.map(|t| t.token),
        })
    }
}

#[async_trait]
impl StreamResolver for HttpBackend {
    async fn resolve_stream_url(&self, token: &str) -> Result<String> {
        debug!(phase = "resolve", "Requesting stream URL");

        let response = self
            .http_client
            .get(self.endpoint("/api/company/stream"))
            .bearer_auth(token)
            .send()
            .await?;

        let body: StreamResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Request(format!("Unexpected stream response: {}", e)))?;

        if let Some(cover) = body.cover.as_deref() {
            debug!(cover, "Stream cover");
        }

        extract_stream_url(&body.stream)
            .ok_or_else(|| Error::Request(format!("No stream URL in '{}'", body.stream)))
    }
}
