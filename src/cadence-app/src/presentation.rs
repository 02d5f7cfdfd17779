use cadence_core::{Config, StatusReporter};
use cadence_player::{LiveLyric, Player};
use std::sync::Arc;

/// Handles a presentation layer needs to follow playback.
#[derive(Debug, Clone, Copy)]
pub struct PresentationContext<'a> {
    pub player: &'a Arc<Player>,
    pub live_lyric: &'a Arc<LiveLyric>,
}

/// The user-facing layer of the app. Only constructed in GUI mode.
pub trait Presentation: StatusReporter {
    fn name(&self) -> &str;

    fn initialize(&self, ctx: PresentationContext<'_>);
}

pub type PresentationFactory = Box<dyn FnOnce(&Config) -> Box<dyn Presentation> + Send>;
