//! Agent configuration loading and resolution
//!
//! Settings are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing default config file is not an error: the agent logs a warning and
//! starts with compiled defaults. An explicitly requested file must exist.

use crate::fade_curves::FadeCurve;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const ENV_CONFIG_PATH: &str = "MUSIQUE_CONFIG";
/// Environment variable overriding `backend.base_url`
pub const ENV_BASE_URL: &str = "MUSIQUE_BASE_URL";
/// Environment variable overriding `connection.mode`
pub const ENV_MODE: &str = "MUSIQUE_MODE";
/// Environment variable holding the login username
pub const ENV_USERNAME: &str = "MUSIQUE_USERNAME";
/// Environment variable holding the login password
pub const ENV_PASSWORD: &str = "MUSIQUE_PASSWORD";

/// Running mode for the agent.
///
/// Only `Online` is implemented. The other modes are recognized so that a
/// configuration asking for them fails loudly instead of silently running
/// online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Stream from the backend. When the connection breaks, playback stops
    /// once the buffered audio runs out and the agent reconnects.
    #[default]
    Online,

    /// Never use online music, even if a connection is available.
    Offline,

    /// Prefer online; fall back to offline music while disconnected.
    #[serde(alias = "mixed")]
    OnlineAndOffline,
}

impl ConnectionMode {
    /// Numeric mode code (0 = online, 1 = offline, 2 = online and offline)
    pub fn code(&self) -> u8 {
        match self {
            ConnectionMode::Online => 0,
            ConnectionMode::Offline => 1,
            ConnectionMode::OnlineAndOffline => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Online => "online",
            ConnectionMode::Offline => "offline",
            ConnectionMode::OnlineAndOffline => "online_and_offline",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "online" | "0" => Ok(ConnectionMode::Online),
            "offline" | "1" => Ok(ConnectionMode::Offline),
            "online_and_offline" | "online-and-offline" | "mixed" | "2" => {
                Ok(ConnectionMode::OnlineAndOffline)
            }
            other => Err(Error::InvalidInput(format!(
                "unknown connection mode '{}' (expected online, offline or online_and_offline)",
                other
            ))),
        }
    }
}

/// What to do with an ad event that arrives while another ad is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdPolicy {
    /// Ignore the event. At most one ad is in flight at a time.
    #[default]
    Reject,

    /// Hold the event in a bounded queue and play it after the current ad.
    Queue,
}

impl FromStr for AdPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "reject" | "drop" => Ok(AdPolicy::Reject),
            "queue" => Ok(AdPolicy::Queue),
            other => Err(Error::InvalidInput(format!("unknown ad policy '{}'", other))),
        }
    }
}

/// Backend endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the backend (login, stream resolution and push channel)
    pub base_url: String,

    /// Path of the Socket.IO endpoint on the backend
    pub socket_path: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://portal-musique-backend.herokuapp.com".to_string(),
            socket_path: "/socket.io".to_string(),
        }
    }
}

/// Connection and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub mode: ConnectionMode,

    /// Wait between connection attempts
    pub retry_backoff_ms: u64,

    /// Connect/read timeout for every network open
    pub timeout_ms: u64,

    /// Capacity of the push-channel event queue
    pub event_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::Online,
            retry_backoff_ms: 5000,
            timeout_ms: 5000,
            event_queue_capacity: 16,
        }
    }
}

impl ConnectionConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Playback and ad overlay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device name (None = system default)
    pub device: Option<String>,

    /// Main stream gain while an ad plays
    pub duck_level: f32,

    /// Duration of the duck and restore fades
    pub fade_ms: u64,

    pub fade_curve: FadeCurve,

    pub ad_policy: AdPolicy,

    /// Maximum number of waiting ads when `ad_policy = "queue"`
    pub ad_queue_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            duck_level: 0.2,
            fade_ms: 500,
            fade_curve: FadeCurve::Linear,
            ad_policy: AdPolicy::Reject,
            ad_queue_capacity: 4,
        }
    }
}

impl PlaybackConfig {
    pub fn fade_duration(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete agent configuration (TOML file layout)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: BackendConfig,
    pub connection: ConnectionConfig,
    pub playback: PlaybackConfig,
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Parse configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            return Err(Error::Config("backend.base_url must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.playback.duck_level) {
            return Err(Error::Config(format!(
                "playback.duck_level must be within 0.0..=1.0 (got {})",
                self.playback.duck_level
            )));
        }
        if self.playback.fade_ms == 0 {
            return Err(Error::Config("playback.fade_ms must be greater than 0".to_string()));
        }
        if self.connection.timeout_ms == 0 {
            return Err(Error::Config("connection.timeout_ms must be greater than 0".to_string()));
        }
        if self.connection.event_queue_capacity == 0 {
            return Err(Error::Config(
                "connection.event_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.playback.ad_policy == AdPolicy::Queue && self.playback.ad_queue_capacity == 0 {
            return Err(Error::Config(
                "playback.ad_queue_capacity must be greater than 0 when ad_policy = \"queue\""
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub mode: Option<ConnectionMode>,
    pub device: Option<String>,
}

/// Resolves the effective configuration from CLI, environment, file and defaults
pub struct ConfigResolver;

impl ConfigResolver {
    pub fn resolve(overrides: &ConfigOverrides) -> Result<AgentConfig> {
        let mut config = Self::load_base(overrides.config_path.as_deref())?;

        // Priority 2: environment variables
        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            if !url.trim().is_empty() {
                debug!("Using {} from environment", ENV_BASE_URL);
                config.backend.base_url = url;
            }
        }
        if let Ok(mode) = std::env::var(ENV_MODE) {
            config.connection.mode = mode.parse()?;
        }

        // Priority 1: command line
        if let Some(url) = &overrides.base_url {
            config.backend.base_url = url.clone();
        }
        if let Some(mode) = overrides.mode {
            config.connection.mode = mode;
        }
        if let Some(device) = &overrides.device {
            config.playback.device = Some(device.clone());
        }

        config.validate()?;
        Ok(config)
    }

    /// Load the TOML layer (or defaults)
    fn load_base(explicit: Option<&Path>) -> Result<AgentConfig> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from));

        if let Some(path) = explicit {
            info!("Loading configuration from {}", path.display());
            return AgentConfig::load_file(&path);
        }

        match default_config_path() {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                AgentConfig::load_file(&path)
            }
            None => {
                warn!("No config file found, using compiled defaults");
                Ok(AgentConfig::default())
            }
        }
    }
}

/// Default configuration file location for the platform, if one exists.
///
/// Checks `<config_dir>/musique/agent.toml` first, then (on Unix)
/// `/etc/musique/agent.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("musique").join("agent.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/musique/agent.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_values() {
        let config = AgentConfig::default();
        assert_eq!(config.connection.retry_backoff(), Duration::from_secs(5));
        assert_eq!(config.connection.timeout(), Duration::from_secs(5));
        assert_eq!(config.playback.fade_duration(), Duration::from_millis(500));
        assert_eq!(config.playback.duck_level, 0.2);
        assert_eq!(config.playback.ad_policy, AdPolicy::Reject);
        assert_eq!(config.connection.mode, ConnectionMode::Online);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_mode_parsing() {
        assert_eq!("online".parse::<ConnectionMode>().unwrap(), ConnectionMode::Online);
        assert_eq!("1".parse::<ConnectionMode>().unwrap(), ConnectionMode::Offline);
        assert_eq!(
            "Mixed".parse::<ConnectionMode>().unwrap(),
            ConnectionMode::OnlineAndOffline
        );
        assert!("sometimes".parse::<ConnectionMode>().is_err());
    }

    #[test]
    fn test_connection_mode_codes() {
        for mode in [
            ConnectionMode::Online,
            ConnectionMode::Offline,
            ConnectionMode::OnlineAndOffline,
        ] {
            assert_eq!(mode.code().to_string().parse::<ConnectionMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AgentConfig::from_toml_str(
            r#"
            [playback]
            duck_level = 0.35
            ad_policy = "queue"
            "#,
        )
        .unwrap();

        assert_eq!(config.playback.duck_level, 0.35);
        assert_eq!(config.playback.ad_policy, AdPolicy::Queue);
        assert_eq!(config.playback.fade_ms, 500);
        assert_eq!(config.backend, BackendConfig::default());
    }

    #[test]
    fn test_mixed_mode_alias_in_toml() {
        let config = AgentConfig::from_toml_str("[connection]\nmode = \"mixed\"\n").unwrap();
        assert_eq!(config.connection.mode, ConnectionMode::OnlineAndOffline);
    }

    #[test]
    fn test_validate_rejects_bad_duck_level() {
        let mut config = AgentConfig::default();
        config.playback.duck_level = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_fade() {
        let mut config = AgentConfig::default();
        config.playback.fade_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_queue_when_queueing() {
        let mut config = AgentConfig::default();
        config.playback.ad_policy = AdPolicy::Queue;
        config.playback.ad_queue_capacity = 0;
        assert!(config.validate().is_err());

        config.playback.ad_policy = AdPolicy::Reject;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = AgentConfig::from_toml_str("[playback\nduck_level = ");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
