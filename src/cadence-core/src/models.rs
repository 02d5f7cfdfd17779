use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A provider-scoped song identifier.
///
/// Providers MUST treat this as an opaque, case-sensitive identifier that is
/// stable across runs; persisted references are built from it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct SongId(pub String);

impl SongId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl AsRef<str> for SongId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SongId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SongId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A playable song as handed out by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub id: SongId,
    pub provider_id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    /// Duration in seconds when known.
    pub duration_seconds: Option<u32>,
    /// Media location for the audio engine, when the provider knows it upfront.
    pub url: Option<String>,
}

impl Song {
    pub fn new(
        provider_id: impl Into<String>,
        id: impl Into<SongId>,
        title: impl Into<String>,
        artist: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            title: title.into(),
            artist: artist.into(),
            album: None,
            duration_seconds: None,
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_duration(mut self, seconds: u32) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// Whether two songs point at the same provider entry.
    pub fn same_entry(&self, other: &Song) -> bool {
        self.provider_id == other.provider_id && self.id == other.id
    }

    /// Short human-readable label, e.g. `"Title - Artist"`.
    pub fn describe(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.title, self.artist)
        }
    }
}

/// How the playlist picks the next song.
///
/// Persisted as its integer ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PlaybackMode {
    /// Repeat the current song.
    OneLoop,
    /// Play through the list once.
    #[default]
    Sequential,
    /// Play through the list and wrap around.
    Loop,
    /// Pick a random entry each time.
    Random,
}

impl PlaybackMode {
    pub fn label(&self) -> &'static str {
        match self {
            PlaybackMode::OneLoop => "one_loop",
            PlaybackMode::Sequential => "sequential",
            PlaybackMode::Loop => "loop",
            PlaybackMode::Random => "random",
        }
    }
}

impl From<PlaybackMode> for u8 {
    fn from(mode: PlaybackMode) -> Self {
        match mode {
            PlaybackMode::OneLoop => 0,
            PlaybackMode::Sequential => 1,
            PlaybackMode::Loop => 2,
            PlaybackMode::Random => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown playback mode {0}")]
pub struct UnknownPlaybackMode(pub u8);

impl TryFrom<u8> for PlaybackMode {
    type Error = UnknownPlaybackMode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PlaybackMode::OneLoop),
            1 => Ok(PlaybackMode::Sequential),
            2 => Ok(PlaybackMode::Loop),
            3 => Ok(PlaybackMode::Random),
            other => Err(UnknownPlaybackMode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_mode_serializes_as_ordinal() {
        assert_eq!(serde_json::to_string(&PlaybackMode::Loop).unwrap(), "2");
        let mode: PlaybackMode = serde_json::from_str("1").unwrap();
        assert_eq!(mode, PlaybackMode::Sequential);
        assert!(serde_json::from_str::<PlaybackMode>("9").is_err());
    }

    #[test]
    fn describe_skips_empty_artist() {
        let song = Song::new("p", "1", "Title", "");
        assert_eq!(song.describe(), "Title");
        let song = Song::new("p", "1", "Title", "Band");
        assert_eq!(song.describe(), "Title - Band");
    }
}
