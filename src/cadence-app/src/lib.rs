//! Application orchestration: builds the runtime for the configured mode and
//! drives it from startup to shutdown.

mod app;
mod integration;
mod plugin;
mod presentation;
mod release;
mod scheduler;

pub use app::{
    App, AppError, AttachError, AttachOptions, DaemonAddrs, DaemonServices, Phase, Subsystems,
    PLAYER_TICK, RELEASE_CHECK_DELAY,
};
pub use integration::{Integration, IntegrationError};
pub use plugin::PluginManager;
pub use presentation::{Presentation, PresentationContext, PresentationFactory};
pub use release::{is_newer, ReleaseCheckError, ReleaseChecker, ReleaseStatus, CURRENT_VERSION};
pub use scheduler::{Scheduler, SchedulerError, TaskId};
