//! The application object: builds the subsystems for the configured mode,
//! wires them together and drives them from startup to shutdown.
//!
//! Lifecycle phases only move forward:
//!
//! ```text
//! Constructed -> Attached -> Initialized -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! `attached`, `initialized` and `about_to_shutdown` fire as the app enters
//! the matching phase. The session is restored on `initialized` and saved on
//! `about_to_shutdown`. Both session slots are connected when the app is
//! created, so they run ahead of every other subscriber, and a failing
//! subscriber never keeps the others from running.

use crate::integration::Integration;
use crate::plugin::PluginManager;
use crate::presentation::{Presentation, PresentationContext, PresentationFactory};
use crate::release::{ReleaseCheckError, ReleaseChecker};
use crate::scheduler::{Scheduler, SchedulerError};
use cadence_audio::{AudioEngine, NullAudioEngine};
use cadence_core::{
    AppDirs, AppMode, AsyncHook, Config, DirsError, LogReporter, Plugin, PluginContext,
    ProviderRegistry, ReferenceResolver, Signal, SlotResult, Song, StatusReporter,
};
use cadence_daemon::{
    live_lyric_publisher, now_playing_publisher, CommandHandler, CommandServer, DaemonError,
    Gateway, PlayerCommands, Publisher,
};
use cadence_player::{LiveLyric, LyricSource, Player, Playlist, RegistryLyrics, SessionStore};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const RELEASE_CHECK_DELAY: Duration = Duration::from_secs(10);
pub const PLAYER_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Constructed,
    Attached,
    Initialized,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Constructed => "constructed",
            Phase::Attached => "attached",
            Phase::Initialized => "initialized",
            Phase::Running => "running",
            Phase::ShuttingDown => "shutting down",
            Phase::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to locate application directories: {0}")]
    Directories(#[from] DirsError),
    #[error("gui mode is enabled but no presentation layer was supplied")]
    MissingPresentation,
    #[error("failed to prepare the release check: {0}")]
    ReleaseCheck(#[from] ReleaseCheckError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error("cannot {operation} while the app is {phase}")]
    Phase {
        operation: &'static str,
        phase: Phase,
    },
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("interrupted before the work finished")]
    Interrupted,
}

/// Collaborators supplied by the embedding binary or a test.
#[derive(Default)]
pub struct AttachOptions {
    /// Defaults to the headless engine on `audio_device`.
    pub engine: Option<Arc<dyn AudioEngine>>,
    pub plugins: Vec<Box<dyn Plugin>>,
    pub integrations: Vec<Box<dyn Integration>>,
    /// Required when the mode includes GUI.
    pub presentation: Option<PresentationFactory>,
    /// Defaults to asking the provider that owns the song.
    pub lyric_source: Option<Arc<dyn LyricSource>>,
    /// Defaults to `state.json` in the data directory.
    pub state_file: Option<PathBuf>,
}

/// Daemon-only objects. Present exactly when the mode includes DAEMON.
pub struct DaemonServices {
    pub gateway: Gateway,
    pub commands: Arc<PlayerCommands>,
    pub live_lyric: Arc<Publisher<String>>,
    pub now_playing: Arc<Publisher<Option<Song>>>,
}

/// Everything `attach` builds.
pub struct Subsystems {
    pub playlist: Arc<Playlist>,
    pub player: Arc<Player>,
    pub registry: Arc<ProviderRegistry>,
    pub live_lyric: Arc<LiveLyric>,
    pub lyric_source: Arc<dyn LyricSource>,
    pub plugins: PluginManager,
    pub plugin_context: PluginContext,
    pub session: SessionStore,
    pub integrations: Vec<Box<dyn Integration>>,
    pub daemon: Option<DaemonServices>,
    pub release_checker: Option<ReleaseChecker>,
    pub presentation: Option<Box<dyn Presentation>>,
}

impl Subsystems {
    pub fn resolver(&self) -> Arc<dyn ReferenceResolver> {
        self.registry.clone()
    }
}

/// Where the daemon listeners ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonAddrs {
    pub command: SocketAddr,
    pub pubsub: SocketAddr,
}

pub struct App {
    config: Arc<Config>,
    mode: AppMode,
    phase: Mutex<Phase>,
    options: Mutex<Option<AttachOptions>>,
    subsystems: OnceLock<Subsystems>,
    hook: AsyncHook,
    scheduler: Scheduler,
    cancel: CancellationToken,
    daemon_addrs: Mutex<Option<DaemonAddrs>>,
    /// Set once the restore slot ran; the session is only saved after that.
    session_restored: AtomicBool,
    pub attached: Signal<()>,
    pub initialized: Signal<()>,
    pub about_to_shutdown: Signal<()>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("mode", &self.mode)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl App {
    /// The mode is fixed here from the configuration.
    pub fn new(config: Config, options: AttachOptions) -> Arc<Self> {
        let mode = config.effective_mode();
        let app = Arc::new(Self {
            config: Arc::new(config),
            mode,
            phase: Mutex::new(Phase::Constructed),
            options: Mutex::new(Some(options)),
            subsystems: OnceLock::new(),
            hook: AsyncHook::new(),
            scheduler: Scheduler::new(),
            cancel: CancellationToken::new(),
            daemon_addrs: Mutex::new(None),
            session_restored: AtomicBool::new(false),
            attached: Signal::new("app.attached"),
            initialized: Signal::new("app.initialized"),
            about_to_shutdown: Signal::new("app.about_to_shutdown"),
        });
        app.initialized
            .connect_weak(&app, |app: &App, _: &()| app.restore_session());
        app.about_to_shutdown
            .connect_weak(&app, |app: &App, _: &()| app.save_session());
        app
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// `None` until [`App::attach`] succeeded.
    pub fn subsystems(&self) -> Option<&Subsystems> {
        self.subsystems.get()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn daemon_addrs(&self) -> Option<DaemonAddrs> {
        *lock(&self.daemon_addrs)
    }

    /// Build the subsystems the mode asks for. Subsystems of disabled modes
    /// are never constructed.
    pub fn attach(&self) -> Result<(), AppError> {
        self.expect_phase("attach", Phase::Constructed)?;
        let options = lock(&self.options).take().unwrap_or_default();
        let subsystems = match self.build(options) {
            Ok(subsystems) => subsystems,
            Err(err) => {
                // The options are consumed; a failed app cannot be attached again.
                *lock(&self.phase) = Phase::Stopped;
                return Err(err.into());
            }
        };
        if self.subsystems.set(subsystems).is_err() {
            return Err(AppError::Phase {
                operation: "attach",
                phase: Phase::Attached,
            });
        }
        self.transition("attach", Phase::Constructed, Phase::Attached)?;
        tracing::info!(mode = %self.mode, "subsystems attached");
        self.announce(&self.attached);
        Ok(())
    }

    fn build(&self, options: AttachOptions) -> Result<Subsystems, AttachError> {
        let engine: Arc<dyn AudioEngine> = match (options.engine, &self.config.audio_device) {
            (Some(engine), _) => engine,
            (None, Some(device)) => Arc::new(NullAudioEngine::with_device(device.clone())),
            (None, None) => Arc::new(NullAudioEngine::new()),
        };
        tracing::debug!(engine = engine.name(), "audio engine selected");
        let playlist = Arc::new(Playlist::new());
        let player = Arc::new(Player::new(engine, playlist.clone()));

        let registry = Arc::new(ProviderRegistry::new());
        let resolver: Arc<dyn ReferenceResolver> = registry.clone();
        let lyric_source: Arc<dyn LyricSource> = match options.lyric_source {
            Some(source) => source,
            None => Arc::new(RegistryLyrics::new(registry.clone())),
        };
        let plugin_context = PluginContext::new(registry.clone(), self.config.clone());
        let plugins = PluginManager::new(options.plugins);

        let session = match options.state_file {
            Some(path) => SessionStore::new(path),
            None => SessionStore::for_dirs(&AppDirs::discover()?),
        };

        let daemon = self.mode.contains(AppMode::DAEMON).then(|| {
            let gateway = Gateway::new();
            DaemonServices {
                commands: Arc::new(PlayerCommands::new(player.clone(), resolver.clone())),
                live_lyric: Arc::new(live_lyric_publisher(&gateway)),
                now_playing: Arc::new(now_playing_publisher(&gateway, resolver.clone())),
                gateway,
            }
        });

        let release_checker = match &self.config.release_check_url {
            Some(url) if self.mode.intersects(AppMode::DAEMON | AppMode::GUI) => {
                Some(ReleaseChecker::new(url.clone())?)
            }
            _ => None,
        };

        let presentation = if self.mode.contains(AppMode::GUI) {
            let factory = options
                .presentation
                .ok_or(AttachError::MissingPresentation)?;
            Some(factory(&self.config))
        } else {
            None
        };

        Ok(Subsystems {
            playlist,
            player,
            registry,
            live_lyric: Arc::new(LiveLyric::new()),
            lyric_source,
            plugins,
            plugin_context,
            session,
            integrations: options.integrations,
            daemon,
            release_checker,
            presentation,
        })
    }

    /// Wire the subsystems together, enable plugins and restore the session.
    pub fn initialize(&self) -> Result<(), AppError> {
        self.expect_phase("initialize", Phase::Attached)?;
        let s = self.require("initialize")?;

        if let Ok(runtime) = Handle::try_current() {
            self.hook.install(runtime);
        }
        s.live_lyric
            .attach(&s.playlist, &s.player, s.lyric_source.clone(), &self.hook);

        if let Some(daemon) = &s.daemon {
            daemon.live_lyric.bridge(&s.live_lyric.sentence_changed);
            daemon.now_playing.bridge(&s.playlist.song_changed);
        }

        let enabled = s.plugins.scan(&s.plugin_context);
        tracing::info!(enabled, providers = ?s.registry.ids(), "plugins scanned");

        if let Some(presentation) = &s.presentation {
            presentation.initialize(PresentationContext {
                player: &s.player,
                live_lyric: &s.live_lyric,
            });
            tracing::debug!(presentation = presentation.name(), "presentation initialized");
        }

        self.transition("initialize", Phase::Attached, Phase::Initialized)?;
        self.announce(&self.initialized);
        Ok(())
    }

    fn restore_session(&self) -> SlotResult {
        let Some(s) = self.subsystems.get() else {
            return Ok(());
        };
        if let Some(state) = s.session.load() {
            SessionStore::apply(&state, &s.player, &s.resolver());
        }
        self.session_restored.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Never overwrites the state file of a session that was not restored.
    fn save_session(&self) -> SlotResult {
        let Some(s) = self.subsystems.get() else {
            return Ok(());
        };
        if !self.session_restored.load(Ordering::SeqCst) {
            tracing::debug!("session was never restored; keeping the state file");
            return Ok(());
        }
        s.session.dump(&s.player, s.resolver().as_ref())?;
        Ok(())
    }

    /// Serve until Ctrl-C or [`App::request_shutdown`], then shut down.
    ///
    /// Failing to bind a daemon listener shuts the app down and returns the error.
    pub async fn run(self: &Arc<Self>) -> Result<(), AppError> {
        self.transition("run", Phase::Initialized, Phase::Running)?;
        let s = self.require("run")?;
        if let Err(err) = self.start_background() {
            self.shutdown();
            return Err(err);
        }

        if let Err(err) = self.schedule_release_check(s) {
            self.shutdown();
            return Err(err);
        }

        for integration in &s.integrations {
            match integration.start(&s.player) {
                Ok(()) => tracing::info!(integration = integration.name(), "integration started"),
                Err(err) => tracing::warn!(
                    integration = integration.name(),
                    error = %err,
                    "integration unavailable; continuing without it"
                ),
            }
        }

        if let Some(daemon) = &s.daemon {
            if let Err(err) = self.start_daemon(daemon).await {
                tracing::error!(error = %err, "daemon failed to start");
                self.shutdown();
                return Err(err.into());
            }
        }
        if !self.mode.intersects(AppMode::DAEMON | AppMode::GUI) {
            tracing::warn!("neither daemon nor gui mode is enabled; nothing will be served");
        }

        let mut ticker = tokio::time::interval(PLAYER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);
        let mut watch_interrupt = true;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                result = &mut interrupt, if watch_interrupt => match result {
                    Ok(()) => {
                        tracing::info!("interrupt received");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot listen for interrupts");
                        watch_interrupt = false;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(err) = s.player.tick() {
                        tracing::warn!(error = %err, "player tick failed");
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Run `work` to completion with async support in place, then shut down.
    ///
    /// Ctrl-C or [`App::request_shutdown`] abandon the work with
    /// [`AppError::Interrupted`]; the app is shut down either way.
    pub async fn run_once<F>(self: &Arc<Self>, work: F) -> Result<F::Output, AppError>
    where
        F: Future,
    {
        self.transition("run", Phase::Initialized, Phase::Running)?;
        if let Err(err) = self.start_background() {
            self.shutdown();
            return Err(err);
        }
        let interrupt = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("interrupt received"),
                Err(err) => {
                    tracing::warn!(error = %err, "cannot listen for interrupts");
                    std::future::pending::<()>().await;
                }
            }
        };
        let result = tokio::select! {
            output = work => Ok(output),
            _ = self.cancel.cancelled() => {
                tracing::info!("shutdown requested");
                Err(AppError::Interrupted)
            }
            _ = interrupt => Err(AppError::Interrupted),
        };
        self.shutdown();
        result
    }

    /// The check is opt-in: nothing is scheduled without `release_check_url`.
    fn schedule_release_check(self: &Arc<Self>, s: &Subsystems) -> Result<(), AppError> {
        let Some(checker) = s.release_checker.clone() else {
            return Ok(());
        };
        let app = Arc::downgrade(self);
        self.scheduler.schedule_after(RELEASE_CHECK_DELAY, async move {
            let Some(app) = app.upgrade() else { return };
            if let Err(err) = checker.check(app.as_ref()).await {
                tracing::warn!(error = %err, "release check failed");
            }
        })?;
        tracing::debug!(delay = ?RELEASE_CHECK_DELAY, "release check scheduled");
        Ok(())
    }

    fn start_background(&self) -> Result<(), AppError> {
        let runtime = Handle::current();
        if !self.hook.is_installed() {
            self.hook.install(runtime.clone());
        }
        self.scheduler.start(&runtime)?;
        Ok(())
    }

    async fn start_daemon(&self, daemon: &DaemonServices) -> Result<DaemonAddrs, DaemonError> {
        let host = self.config.listen_addr();
        let command_addr = SocketAddr::new(host, self.config.daemon.command_port);
        let pubsub_addr = SocketAddr::new(host, self.config.daemon.pubsub_port);
        let handler: Arc<dyn CommandHandler> = daemon.commands.clone();

        let (command, pubsub) = tokio::try_join!(
            CommandServer::bind(command_addr, handler, self.config.daemon.io_timeout()),
            daemon.gateway.listen(pubsub_addr),
        )?;
        let addrs = DaemonAddrs {
            command: command.local_addr()?,
            pubsub: pubsub.local_addr()?,
        };
        tokio::spawn(command.serve(self.cancel.child_token()));
        tokio::spawn(pubsub.serve(self.cancel.child_token()));
        *lock(&self.daemon_addrs) = Some(addrs);
        tracing::info!(command = %addrs.command, pubsub = %addrs.pubsub, "daemon started");
        Ok(addrs)
    }

    /// Ask a running app to shut down.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Save the session and release every subsystem. Only the first call
    /// does anything.
    pub fn shutdown(&self) {
        {
            let mut phase = lock(&self.phase);
            if *phase >= Phase::ShuttingDown {
                tracing::debug!(phase = %*phase, "shutdown already done");
                return;
            }
            *phase = Phase::ShuttingDown;
        }
        tracing::info!("shutting down");

        for err in self.about_to_shutdown.emit_all(&()) {
            tracing::error!(error = %err, "shutdown subscriber failed");
        }
        if let Some(s) = self.subsystems.get() {
            s.player.stop();
            s.player.shutdown();
            for integration in &s.integrations {
                integration.stop();
            }
            s.plugins.shutdown(&s.plugin_context);
        }
        self.hook.teardown();
        self.cancel.cancel();
        self.scheduler.shutdown();

        *lock(&self.phase) = Phase::Stopped;
        tracing::info!("shutdown complete");
    }

    /// Route a status message to the presentation, or to the log without one.
    pub fn show_msg(&self, msg: &str) {
        match self.subsystems().and_then(|s| s.presentation.as_ref()) {
            Some(presentation) => presentation.show_msg(msg),
            None => LogReporter.show_msg(msg),
        }
    }

    fn announce(&self, signal: &Signal<()>) {
        for err in signal.emit_all(&()) {
            tracing::error!(error = %err, "lifecycle subscriber failed");
        }
    }

    fn require(&self, operation: &'static str) -> Result<&Subsystems, AppError> {
        self.subsystems.get().ok_or_else(|| AppError::Phase {
            operation,
            phase: self.phase(),
        })
    }

    fn expect_phase(&self, operation: &'static str, expected: Phase) -> Result<(), AppError> {
        let phase = self.phase();
        if phase == expected {
            Ok(())
        } else {
            Err(AppError::Phase { operation, phase })
        }
    }

    fn transition(&self, operation: &'static str, from: Phase, to: Phase) -> Result<(), AppError> {
        let mut phase = lock(&self.phase);
        if *phase != from {
            return Err(AppError::Phase {
                operation,
                phase: *phase,
            });
        }
        *phase = to;
        tracing::debug!(from = %from, to = %to, "lifecycle transition");
        Ok(())
    }
}

impl StatusReporter for App {
    fn show_msg(&self, msg: &str) {
        App::show_msg(self, msg);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
