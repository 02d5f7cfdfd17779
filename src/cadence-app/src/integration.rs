use cadence_player::Player;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("{integration} is not available on this system: {reason}")]
    Unavailable {
        integration: String,
        reason: String,
    },
    #[error("{integration} failed to start: {reason}")]
    Failed {
        integration: String,
        reason: String,
    },
}

/// An OS-level shim such as a hotkey listener or a media-control bridge.
///
/// Integrations are optional: a start failure leaves the app running
/// without that integration.
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, player: &Arc<Player>) -> Result<(), IntegrationError>;

    fn stop(&self) {}
}
