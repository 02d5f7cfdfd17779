//! Shared building blocks for the Cadence runtime: the signal bus, song
//! models, provider and reference plumbing, configuration and logging.

pub mod action;
pub mod config;
pub mod logging;
pub mod mode;
pub mod models;
pub mod paths;
pub mod plugin;
pub mod provider;
pub mod resolver;
pub mod signal;

pub use action::{with_action, Action, ActionError, ActionOutcome, LogReporter, StatusReporter};
pub use config::{
    Config, ConfigError, DaemonConfig, LibraryConfig, LogLevel, LoggingConfig, ValidationError,
};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use mode::{AppMode, UnknownAppMode};
pub use models::{PlaybackMode, Song, SongId};
pub use paths::{AppDirs, DirsError};
pub use plugin::{Plugin, PluginContext, PluginError};
pub use provider::{Provider, ProviderCapabilities, ProviderError, ProviderResult};
pub use resolver::{reverse_line, ProviderRegistry, ReferenceResolver, ResolveError};
pub use signal::{AsyncHook, Signal, SignalError, SlotError, SlotId, SlotResult};

pub const APP_NAME: &str = "cadence";
pub const APP_AUTHOR: &str = "Cadence";
pub const APP_QUALIFIER: &str = "io";
