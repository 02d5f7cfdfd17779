//! Live lyrics: follows the current song and playback position and emits the
//! lyric line that should be on screen.

use crate::player::Player;
use crate::playlist::Playlist;
use async_trait::async_trait;
use cadence_core::{AsyncHook, ProviderRegistry, Signal, Song};
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// A parsed LRC document: timestamped lines sorted by time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lyric {
    lines: Vec<(f64, String)>,
}

impl Lyric {
    /// Parse LRC text. Lines may carry several `[mm:ss.xx]` stamps; metadata
    /// tags such as `[ar:...]` and unstamped lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let mut rest = raw.trim();
            let mut stamps = Vec::new();
            while let Some(body) = rest.strip_prefix('[') {
                let Some((tag, tail)) = body.split_once(']') else {
                    break;
                };
                match parse_timestamp(tag) {
                    Some(seconds) => stamps.push(seconds),
                    None => break,
                }
                rest = tail;
            }
            let sentence = rest.trim();
            for seconds in stamps {
                lines.push((seconds, sentence.to_string()));
            }
        }
        lines.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { lines }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Index of the line showing at `position` seconds.
    pub fn index_at(&self, position: f64) -> Option<usize> {
        let after = self.lines.partition_point(|(start, _)| *start <= position);
        after.checked_sub(1)
    }

    pub fn line(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(|(_, text)| text.as_str())
    }
}

fn parse_timestamp(tag: &str) -> Option<f64> {
    let (minutes, seconds) = tag.split_once(':')?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    let seconds: f64 = seconds.trim().parse().ok()?;
    if !(0.0..60.0).contains(&seconds) {
        return None;
    }
    Some(f64::from(minutes) * 60.0 + seconds)
}

/// Where lyrics for a song come from.
#[async_trait]
pub trait LyricSource: Send + Sync {
    /// LRC text for `song`, or `None` when it has no lyrics.
    async fn lyrics(&self, song: &Song) -> Option<String>;
}

/// Asks the provider that owns the song.
#[derive(Debug, Clone)]
pub struct RegistryLyrics {
    registry: Arc<ProviderRegistry>,
}

impl RegistryLyrics {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl LyricSource for RegistryLyrics {
    async fn lyrics(&self, song: &Song) -> Option<String> {
        let provider = self.registry.get(&song.provider_id)?;
        if !provider.capabilities().supports_lyrics() {
            return None;
        }
        let id = song.id.clone();
        let lookup = tokio::task::spawn_blocking(move || provider.lyrics(&id)).await;
        match lookup {
            Ok(Ok(text)) => Some(text),
            Ok(Err(err)) => {
                tracing::debug!(song = %song.describe(), error = %err, "no lyrics");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "lyric lookup task failed");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct LyricState {
    song: Option<Song>,
    lyric: Lyric,
    index: Option<usize>,
}

#[derive(Debug)]
pub struct LiveLyric {
    state: Mutex<LyricState>,
    pub sentence_changed: Signal<String>,
}

impl Default for LiveLyric {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveLyric {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LyricState::default()),
            sentence_changed: Signal::new("live_lyric.sentence_changed"),
        }
    }

    /// Follow `playlist` and `player`, loading lyrics from `source` on the
    /// hook's runtime. The connections do not keep `self` alive.
    pub fn attach(
        self: &Arc<Self>,
        playlist: &Playlist,
        player: &Player,
        source: Arc<dyn LyricSource>,
        hook: &AsyncHook,
    ) {
        playlist
            .song_changed
            .connect_weak(self, |lyric: &LiveLyric, song: &Option<Song>| {
                lyric.on_song_changed(song.as_ref());
                Ok(())
            });

        playlist.song_changed.connect_weak_async(
            hook,
            self,
            move |lyric: &Arc<LiveLyric>, song: &Option<Song>| {
                let weak: Weak<LiveLyric> = Arc::downgrade(lyric);
                let source = Arc::clone(&source);
                let song = song.clone();
                async move {
                    let Some(song) = song else { return };
                    let text = source.lyrics(&song).await;
                    if let Some(lyric) = weak.upgrade() {
                        lyric.set_lyric(&song, text.as_deref());
                    }
                }
                .boxed()
            },
        );

        player
            .position_changed
            .connect_weak(self, |lyric: &LiveLyric, position: &f64| {
                lyric.on_position_changed(*position);
                Ok(())
            });
    }

    /// Forget the current lyric and clear the displayed sentence.
    pub fn on_song_changed(&self, song: Option<&Song>) {
        {
            let mut state = self.lock();
            *state = LyricState {
                song: song.cloned(),
                ..LyricState::default()
            };
        }
        self.emit_sentence(String::new());
    }

    /// Install lyrics for `song`, ignored when another song became current meanwhile.
    pub fn set_lyric(&self, song: &Song, text: Option<&str>) {
        let mut state = self.lock();
        let still_current = state
            .song
            .as_ref()
            .is_some_and(|current| current.same_entry(song));
        if !still_current {
            tracing::trace!(song = %song.describe(), "discarding lyrics for stale song");
            return;
        }
        state.lyric = text.map(Lyric::parse).unwrap_or_default();
        state.index = None;
        tracing::debug!(song = %song.describe(), lines = state.lyric.len(), "lyrics loaded");
    }

    pub fn on_position_changed(&self, position: f64) {
        let sentence = {
            let mut state = self.lock();
            let index = state.lyric.index_at(position);
            if index == state.index {
                return;
            }
            state.index = index;
            index
                .and_then(|index| state.lyric.line(index))
                .unwrap_or_default()
                .to_string()
        };
        self.emit_sentence(sentence);
    }

    pub fn current_sentence(&self) -> String {
        let state = self.lock();
        state
            .index
            .and_then(|index| state.lyric.line(index))
            .unwrap_or_default()
            .to_string()
    }

    fn emit_sentence(&self, sentence: String) {
        if let Err(err) = self.sentence_changed.emit(&sentence) {
            tracing::warn!(error = %err, "sentence_changed subscriber failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, LyricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
