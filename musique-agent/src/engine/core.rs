//! Connection orchestrator
//!
//! **Responsibilities:**
//! - Engine lifecycle (start, stop)
//! - Connect sequence: login → push channel → stream URL
//! - One PlaybackSession per successful connect, fed with push-channel ad
//!   events
//! - Backoff and retry after every failure or session end
//!
//! ```text
//! Idle ─start─▶ Connecting ──ok──▶ Streaming
//!                 ▲    │              │
//!                 │ failure      session ended
//!                 │    ▼              │
//!                 └── backoff ◀───────┘
//! any ─stop─▶ Idle          non-recoverable error ─▶ Faulted
//! ```
//!
//! Streaming is entered only once the session reports its stream and
//! device open. A session that fails to open counts as a failed connect.

use crate::audio::decoder::AudioDecoder;
use crate::audio::output::AudioDevice;
use crate::engine::collaborators::{LoginClient, PushChannel, PushConnector, StreamResolver};
use crate::error::{Error, Result};
use crate::events::{AdEvent, PlaybackState};
use crate::playback::session::{PlaybackSession, SessionExit, SessionSettings};
use musique_common::{AgentConfig, ConnectionMode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mode: ConnectionMode,
    pub username: String,
    pub password: String,
    /// Wait between connection attempts
    pub retry_backoff: Duration,
    /// Upper bound on opening the push channel
    pub open_timeout: Duration,
    /// Capacity of the push-channel → engine event queue
    pub event_queue_capacity: usize,
    pub session: SessionSettings,
}

impl EngineSettings {
    pub fn from_config(config: &AgentConfig, username: &str, password: &str) -> Self {
        Self {
            mode: config.connection.mode,
            username: username.to_string(),
            password: password.to_string(),
            retry_backoff: config.connection.retry_backoff(),
            open_timeout: config.connection.timeout(),
            event_queue_capacity: config.connection.event_queue_capacity.max(1),
            session: SessionSettings::from_config(&config.playback),
        }
    }
}

/// Everything the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub login: Arc<dyn LoginClient>,
    pub resolver: Arc<dyn StreamResolver>,
    pub push: Arc<dyn PushConnector>,
    pub decoder: Arc<dyn AudioDecoder>,
    pub device: Arc<dyn AudioDevice>,
}

/// Counters for observation and tests
#[derive(Debug, Default)]
struct EngineStats {
    connect_attempts: AtomicU64,
    backoffs: AtomicU64,
    sessions_started: AtomicU64,
    ad_events_forwarded: AtomicU64,
}

/// Top-level state machine driving playback.
pub struct Engine {
    runner: Runner,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(settings: EngineSettings, collaborators: Collaborators) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::Idle);

        Self {
            runner: Runner {
                settings: Arc::new(settings),
                collaborators,
                state_tx: Arc::new(state_tx),
                cancel: CancellationToken::new(),
                stats: Arc::new(EngineStats::default()),
            },
            task: Mutex::new(None),
        }
    }

    /// Spawn the run loop on the current tokio runtime.
    ///
    /// Starting a running engine is a no-op. A stopped engine cannot be
    /// restarted.
    pub fn start(&self) -> Result<()> {
        if self.runner.cancel.is_cancelled() {
            return Err(Error::Internal("Engine has been stopped".to_string()));
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            debug!("Engine already started");
            return Ok(());
        }

        info!(mode = %self.runner.settings.mode, "Starting engine");
        let runner = self.runner.clone();
        *task = Some(tokio::spawn(runner.run()));
        Ok(())
    }

    /// Stop from any state and wait for teardown.
    ///
    /// Interrupts any backoff wait, stops the session (device drained and
    /// closed), closes the push channel and settles in Idle. Idempotent.
    pub async fn stop(&self) {
        self.runner.cancel.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            info!("Stopping engine");
            if let Err(e) = task.await {
                error!("Engine task ended abnormally: {}", e);
            }
            info!("Engine stopped");
        }

        self.runner.set_state(PlaybackState::Idle);
    }

    pub fn state(&self) -> PlaybackState {
        *self.runner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.runner.state_tx.subscribe()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.runner.stats.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn backoffs(&self) -> u64 {
        self.runner.stats.backoffs.load(Ordering::Relaxed)
    }

    pub fn sessions_started(&self) -> u64 {
        self.runner.stats.sessions_started.load(Ordering::Relaxed)
    }

    pub fn ad_events_forwarded(&self) -> u64 {
        self.runner.stats.ad_events_forwarded.load(Ordering::Relaxed)
    }
}

/// Result of a successful connect sequence
struct Connection {
    channel: Box<dyn PushChannel>,
    events: mpsc::Receiver<AdEvent>,
    url: String,
}

/// How a streaming phase ended
enum StreamOutcome {
    /// Engine stop requested
    Cancelled,
    /// Session never got its stream and device open
    Failed(Error),
    Ended(SessionExit),
}

/// State shared between the engine handle and its run task
#[derive(Clone)]
struct Runner {
    settings: Arc<EngineSettings>,
    collaborators: Collaborators,
    state_tx: Arc<watch::Sender<PlaybackState>>,
    cancel: CancellationToken,
    stats: Arc<EngineStats>,
}

impl Runner {
    async fn run(self) {
        let mut attempt: u64 = 0;

        while !self.cancel.is_cancelled() {
            if self.settings.mode != ConnectionMode::Online {
                let e = Error::NotImplemented(format!(
                    "connection mode '{}'",
                    self.settings.mode
                ));
                error!(mode = %self.settings.mode, "Cannot run: {}", e);
                self.set_state(PlaybackState::Faulted);
                return;
            }

            attempt += 1;
            self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
            self.set_state(PlaybackState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect(attempt) => result,
            };

            let outcome = match connected {
                Ok(connection) => self.stream(connection).await,
                Err(e) => StreamOutcome::Failed(e),
            };

            match outcome {
                StreamOutcome::Cancelled => break,
                StreamOutcome::Ended(exit) => {
                    attempt = 0;
                    info!(phase = "streaming", "Session ended ({}), reconnecting", exit);
                    self.set_state(PlaybackState::Connecting);
                }
                StreamOutcome::Failed(e) if !e.is_recoverable() => {
                    error!(phase = "connecting", attempt, "Giving up: {}", e);
                    self.set_state(PlaybackState::Faulted);
                    return;
                }
                StreamOutcome::Failed(e) => {
                    warn!(phase = "connecting", attempt, "Connection attempt failed: {}", e);
                }
            }

            if !self.backoff().await {
                break;
            }
        }

        self.set_state(PlaybackState::Idle);
        debug!("Engine run loop exited");
    }

    /// Login, open the push channel, resolve the stream URL.
    async fn connect(&self, attempt: u64) -> Result<Connection> {
        info!(phase = "connecting", attempt, "Connecting");
        let c = &self.collaborators;

        let credentials = c
            .login
            .login(&self.settings.username, &self.settings.password)
            .await?;
        if credentials.access_token.is_empty() {
            return Err(Error::Request("Login returned an empty access token".to_string()));
        }
        let token = credentials.access_token;
        debug!(phase = "login", "Logged in");

        let (events_tx, events) = mpsc::channel(self.settings.event_queue_capacity);
        let mut channel = tokio::time::timeout(self.settings.open_timeout, c.push.open(&token, events_tx))
            .await
            .map_err(|_| {
                Error::Connectivity(format!(
                    "Push channel did not open within {:?}",
                    self.settings.open_timeout
                ))
            })??;
        debug!(phase = "push", "Push channel open");

        let url = match c.resolver.resolve_stream_url(&token).await {
            Ok(url) if !url.trim().is_empty() => url.trim().to_string(),
            Ok(_) => {
                close_channel(channel.as_mut()).await;
                return Err(Error::Request("Backend returned an empty stream URL".to_string()));
            }
            Err(e) => {
                close_channel(channel.as_mut()).await;
                return Err(e);
            }
        };
        info!(phase = "resolve", url = %url, "Resolved stream");

        Ok(Connection {
            channel,
            events,
            url,
        })
    }

    /// Run one session until it ends or the engine is stopped.
    ///
    /// Waits for the session to open its stream and device before counting
    /// it and entering Streaming.
    async fn stream(&self, connection: Connection) -> StreamOutcome {
        let Connection {
            mut channel,
            mut events,
            url,
        } = connection;
        let c = &self.collaborators;

        let mut session = match PlaybackSession::start(
            &url,
            Arc::clone(&c.decoder),
            Arc::clone(&c.device),
            self.settings.session.clone(),
        ) {
            Ok(session) => session,
            Err(e) => {
                close_channel(channel.as_mut()).await;
                return StreamOutcome::Failed(e);
            }
        };
        let session_id = session.id();

        let (Some(mut ready_rx), Some(mut exit_rx)) = (session.take_ready(), session.take_exit()) else {
            self.teardown(session, channel.as_mut()).await;
            return StreamOutcome::Failed(Error::Internal(
                "Session receivers missing".to_string(),
            ));
        };

        let ready = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.teardown(session, channel.as_mut()).await;
                return StreamOutcome::Cancelled;
            }
            ready = &mut ready_rx => ready.is_ok(),
        };

        if !ready {
            // Ready sender dropped unsent: the thread has exited or is exiting
            let error = match (&mut exit_rx).await {
                Ok(SessionExit::Failed(e)) => e,
                Ok(exit) => Error::Internal(format!("Session exited before opening ({})", exit)),
                Err(_) => Error::Internal("Playback thread vanished".to_string()),
            };
            debug!(session = %session_id, "Session failed to open: {}", error);
            self.teardown(session, channel.as_mut()).await;
            return StreamOutcome::Failed(error);
        }

        self.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.set_state(PlaybackState::Streaming);

        let mut events_open = true;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StreamOutcome::Cancelled,
                exit = &mut exit_rx => {
                    let exit = exit.unwrap_or_else(|_| {
                        SessionExit::Failed(Error::Internal("Playback thread vanished".to_string()))
                    });
                    break StreamOutcome::Ended(exit);
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        self.stats.ad_events_forwarded.fetch_add(1, Ordering::Relaxed);
                        let decision = session.enqueue_ad(event.clone());
                        debug!(session = %session_id, url = %event.url, ?decision, "Ad event forwarded");
                    }
                    None => {
                        warn!(session = %session_id, "Push channel closed, continuing without ads");
                        events_open = false;
                    }
                },
            }
        };

        // No further ad events once teardown starts
        events.close();
        self.teardown(session, channel.as_mut()).await;

        outcome
    }

    /// Stop the session off the runtime threads, then close the push channel.
    async fn teardown(&self, mut session: PlaybackSession, channel: &mut dyn PushChannel) {
        let session_id = session.id();
        let stopped = tokio::task::spawn_blocking(move || session.stop()).await;
        if let Err(e) = stopped {
            error!(session = %session_id, "Session teardown failed: {}", e);
        }
        close_channel(channel).await;
    }

    /// Wait out the retry interval. Returns false if cancelled meanwhile.
    async fn backoff(&self) -> bool {
        self.stats.backoffs.fetch_add(1, Ordering::Relaxed);
        debug!(delay_ms = self.settings.retry_backoff.as_millis() as u64, "Backing off");

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.retry_backoff) => true,
        }
    }

    fn set_state(&self, state: PlaybackState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "Engine state changed");
            *current = state;
            true
        });
    }
}

async fn close_channel(channel: &mut dyn PushChannel) {
    if let Err(e) = channel.close().await {
        warn!("Failed to close push channel: {}", e);
    }
}
