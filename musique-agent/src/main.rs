//! Musique agent (musique-agent) - Main entry point
//!
//! Resolves configuration, wires the HTTP backend, Socket.IO push channel,
//! MP3 decoder and audio device into an [`Engine`] and runs it until Ctrl+C
//! or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use musique_agent::audio::{CpalDevice, SymphoniaDecoder};
use musique_agent::connectivity::{HttpBackend, SocketIoConnector};
use musique_agent::{Collaborators, Engine, EngineSettings, PlaybackState};
use musique_common::config::{ConfigOverrides, ConfigResolver, ENV_PASSWORD, ENV_USERNAME};
use musique_common::ConnectionMode;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for musique-agent
#[derive(Parser, Debug)]
#[command(name = "musique-agent")]
#[command(about = "Background-music playback agent with ad overlay")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Connection mode: online, offline, online_and_offline (or 0/1/2)
    #[arg(long)]
    mode: Option<ConnectionMode>,

    /// Account username
    #[arg(short, long, env = ENV_USERNAME)]
    username: Option<String>,

    /// Account password
    #[arg(short, long, env = ENV_PASSWORD, hide_env_values = true)]
    password: Option<String>,

    /// Output device name (default: system default device)
    #[arg(long)]
    device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

/// Default filter when RUST_LOG is not set
fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("musique_agent={0},musique_common={0}", level))
        .unwrap_or_else(|_| EnvFilter::new("musique_agent=info,musique_common=info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Start at the default level; the configured level is applied once the
    // config file has been read
    let env_filter = EnvFilter::try_from_default_env().ok();
    let rust_log_set = env_filter.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| default_filter("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Log build identification immediately after tracing init
    info!(
        "Starting musique-agent v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();

    if args.list_devices {
        for name in CpalDevice::list_devices().context("Failed to list audio devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let overrides = ConfigOverrides {
        config_path: args.config.clone(),
        base_url: args.base_url.clone(),
        mode: args.mode,
        device: args.device.clone(),
    };
    let config = ConfigResolver::resolve(&overrides).context("Failed to load configuration")?;

    if !rust_log_set {
        filter_handle
            .reload(default_filter(&config.logging.level))
            .context("Failed to apply log level")?;
    }

    info!(
        base_url = %config.backend.base_url,
        mode = %config.connection.mode,
        device = config.playback.device.as_deref().unwrap_or("default"),
        "Configuration loaded"
    );

    let Some(username) = args.username else {
        bail!("No username given (use --username or {})", ENV_USERNAME);
    };
    let Some(password) = args.password else {
        bail!("No password given (use --password or {})", ENV_PASSWORD);
    };

    let timeout = config.connection.timeout();
    let backend = Arc::new(
        HttpBackend::new(&config.backend.base_url, timeout)
            .context("Failed to initialize backend client")?,
    );
    let collaborators = Collaborators {
        login: backend.clone(),
        resolver: backend,
        push: Arc::new(SocketIoConnector::new(
            &config.backend.base_url,
            &config.backend.socket_path,
            timeout,
        )),
        decoder: Arc::new(SymphoniaDecoder::new(timeout)),
        device: Arc::new(CpalDevice::new(config.playback.device.clone())),
    };

    let engine = Engine::new(
        EngineSettings::from_config(&config, &username, &password),
        collaborators,
    );
    let mut state_rx = engine.subscribe();
    engine.start().context("Failed to start engine")?;

    let faulted = tokio::select! {
        _ = shutdown_signal() => false,
        _ = wait_for_fault(&mut state_rx) => true,
    };

    engine.stop().await;

    if faulted {
        bail!("Engine stopped on an unrecoverable error");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolves when the engine enters Faulted
async fn wait_for_fault(state_rx: &mut watch::Receiver<PlaybackState>) {
    loop {
        if *state_rx.borrow_and_update() == PlaybackState::Faulted {
            error!("Engine faulted");
            return;
        }
        if state_rx.changed().await.is_err() {
            // Engine dropped; nothing more to wait for
            std::future::pending::<()>().await;
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
