use crate::models::{Song, SongId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capability flags describing optional provider features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Songs can be exported as reference strings and resolved back.
    pub references: bool,
    pub lyrics: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            references: true,
            lyrics: false,
        }
    }
}

impl ProviderCapabilities {
    pub fn supports_references(&self) -> bool {
        self.references
    }

    pub fn supports_lyrics(&self) -> bool {
        self.lyrics
    }
}

/// Common categories of provider failures surfaced to the core.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {message}")]
    NetworkError { message: String },
    #[error("entity not found: {entity}")]
    NotFound { entity: String },
    #[error("operation not supported: {operation}")]
    NotSupported { operation: String },
    #[error("{message}")]
    Other { message: String },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// A source of songs, usually contributed by a plugin.
pub trait Provider: Send + Sync {
    /// Stable provider identifier (e.g. "local"). Appears in reference strings.
    fn id(&self) -> &str;

    /// Human-friendly provider name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Look up a song by its provider-scoped id.
    fn song(&self, id: &SongId) -> ProviderResult<Song>;

    /// Returns LRC-formatted lyrics for the given song.
    fn lyrics(&self, _id: &SongId) -> ProviderResult<String> {
        Err(ProviderError::NotSupported {
            operation: "lyrics".into(),
        })
    }
}
