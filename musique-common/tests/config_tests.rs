//! Integration tests for configuration resolution
//!
//! Tests the priority order CLI > environment > TOML file > defaults and the
//! graceful fallback when no config file exists.
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate MUSIQUE_* variables are marked with #[serial].

use musique_common::config::{
    AgentConfig, ConfigOverrides, ConfigResolver, ENV_BASE_URL, ENV_CONFIG_PATH, ENV_MODE,
};
use musique_common::{AdPolicy, ConnectionMode, Error, FadeCurve};
use serial_test::serial;
use std::env;
use std::io::Write;
use tempfile::NamedTempFile;

fn clear_env() {
    env::remove_var(ENV_CONFIG_PATH);
    env::remove_var(ENV_BASE_URL);
    env::remove_var(ENV_MODE);
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes()).expect("Failed to write config");
    file
}

#[test]
#[serial]
fn test_explicit_file_is_loaded() {
    clear_env();
    let file = write_config(
        r#"
        [backend]
        base_url = "http://backend.local:8080"

        [connection]
        retry_backoff_ms = 250

        [playback]
        fade_curve = "s_curve"
        ad_policy = "queue"
        ad_queue_capacity = 2
        "#,
    );

    let overrides = ConfigOverrides {
        config_path: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    let config = ConfigResolver::resolve(&overrides).unwrap();

    assert_eq!(config.backend.base_url, "http://backend.local:8080");
    assert_eq!(config.connection.retry_backoff_ms, 250);
    assert_eq!(config.playback.fade_curve, FadeCurve::SCurve);
    assert_eq!(config.playback.ad_policy, AdPolicy::Queue);
    assert_eq!(config.playback.ad_queue_capacity, 2);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    clear_env();
    let overrides = ConfigOverrides {
        config_path: Some("/nonexistent/musique/agent.toml".into()),
        ..Default::default()
    };

    let result = ConfigResolver::resolve(&overrides);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_config_path_from_environment() {
    clear_env();
    let file = write_config("[connection]\ntimeout_ms = 1234\n");
    env::set_var(ENV_CONFIG_PATH, file.path());

    let config = ConfigResolver::resolve(&ConfigOverrides::default()).unwrap();
    assert_eq!(config.connection.timeout_ms, 1234);

    clear_env();
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    clear_env();
    let file = write_config("[backend]\nbase_url = \"http://from-file\"\n");
    env::set_var(ENV_BASE_URL, "http://from-env");
    env::set_var(ENV_MODE, "2");

    let overrides = ConfigOverrides {
        config_path: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    let config = ConfigResolver::resolve(&overrides).unwrap();

    assert_eq!(config.backend.base_url, "http://from-env");
    assert_eq!(config.connection.mode, ConnectionMode::OnlineAndOffline);

    clear_env();
}

#[test]
#[serial]
fn test_cli_overrides_environment() {
    clear_env();
    let file = write_config("");
    env::set_var(ENV_BASE_URL, "http://from-env");

    let overrides = ConfigOverrides {
        config_path: Some(file.path().to_path_buf()),
        base_url: Some("http://from-cli".to_string()),
        mode: Some(ConnectionMode::Offline),
        device: Some("USB DAC".to_string()),
    };
    let config = ConfigResolver::resolve(&overrides).unwrap();

    assert_eq!(config.backend.base_url, "http://from-cli");
    assert_eq!(config.connection.mode, ConnectionMode::Offline);
    assert_eq!(config.playback.device.as_deref(), Some("USB DAC"));

    clear_env();
}

#[test]
#[serial]
fn test_invalid_mode_in_environment_is_rejected() {
    clear_env();
    let file = write_config("");
    env::set_var(ENV_MODE, "sideways");

    let overrides = ConfigOverrides {
        config_path: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    assert!(ConfigResolver::resolve(&overrides).is_err());

    clear_env();
}

#[test]
#[serial]
fn test_resolved_config_is_validated() {
    clear_env();
    let file = write_config("[playback]\nduck_level = -0.1\n");

    let overrides = ConfigOverrides {
        config_path: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    assert!(matches!(
        ConfigResolver::resolve(&overrides),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_serialized_defaults_parse_back() {
    let defaults = AgentConfig::default();
    let text = toml::to_string(&defaults).unwrap();
    let parsed = AgentConfig::from_toml_str(&text).unwrap();
    assert_eq!(parsed, defaults);
}
