use crate::playlist::Playlist;
use cadence_audio::{AudioEngine, AudioError, AudioHandle, AudioSource, AudioState};
use cadence_core::{Signal, Song};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Smallest position change reported through `position_changed`.
const POSITION_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl PlayerState {
    pub fn label(&self) -> &'static str {
        match self {
            PlayerState::Stopped => "stopped",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
        }
    }
}

/// Payload of [`Player::media_about_to_change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChange {
    pub old: Option<Song>,
    pub new: Option<Song>,
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("song '{song}' has no playable media")]
    NoMedia { song: String },
    #[error("failed to load '{song}': {source}")]
    Load {
        song: String,
        #[source]
        source: AudioError,
    },
    #[error("seek failed: {0}")]
    Seek(#[source] AudioError),
    #[error("player has been shut down")]
    ShutDown,
}

struct PlayerInner {
    handle: Option<Box<dyn AudioHandle>>,
    current: Option<Song>,
    state: PlayerState,
    volume: f64,
    play_range_start: Option<f64>,
    last_position: Option<f64>,
    shut_down: bool,
}

impl Default for PlayerInner {
    fn default() -> Self {
        Self {
            handle: None,
            current: None,
            state: PlayerState::Stopped,
            volume: 1.0,
            play_range_start: None,
            last_position: None,
            shut_down: false,
        }
    }
}

/// Drives the audio engine for the songs of a [`Playlist`].
///
/// The internal lock is never held while a signal is emitted, so subscribers
/// may call back into the player.
pub struct Player {
    engine: Arc<dyn AudioEngine>,
    playlist: Arc<Playlist>,
    inner: Mutex<PlayerInner>,
    pub media_about_to_change: Signal<MediaChange>,
    pub state_changed: Signal<PlayerState>,
    pub position_changed: Signal<f64>,
    /// Emitted with the song whose media played to the end.
    pub media_finished: Signal<Song>,
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Player")
            .field("engine", &self.engine.name())
            .field("state", &inner.state)
            .field("current", &inner.current.as_ref().map(Song::describe))
            .field("volume", &inner.volume)
            .finish()
    }
}

impl Player {
    pub fn new(engine: Arc<dyn AudioEngine>, playlist: Arc<Playlist>) -> Self {
        Self {
            engine,
            playlist,
            inner: Mutex::new(PlayerInner::default()),
            media_about_to_change: Signal::new("player.media_about_to_change"),
            state_changed: Signal::new("player.state_changed"),
            position_changed: Signal::new("player.position_changed"),
            media_finished: Signal::new("player.media_finished"),
        }
    }

    pub fn playlist(&self) -> &Arc<Playlist> {
        &self.playlist
    }

    pub fn state(&self) -> PlayerState {
        self.lock().state
    }

    /// Song whose media is loaded (kept after `stop`).
    pub fn current_song(&self) -> Option<Song> {
        self.lock().current.clone()
    }

    pub fn volume(&self) -> f64 {
        self.lock().volume
    }

    pub fn set_volume(&self, volume: f64) {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let mut inner = self.lock();
        inner.volume = volume;
        if let Some(handle) = inner.handle.as_mut() {
            handle.set_volume(volume as f32);
        }
    }

    /// Playback position of the loaded media in seconds.
    pub fn position(&self) -> f64 {
        self.lock()
            .handle
            .as_ref()
            .map(|handle| handle.position().as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn duration(&self) -> Option<f64> {
        self.lock()
            .handle
            .as_ref()
            .and_then(|handle| handle.duration())
            .map(|duration| duration.as_secs_f64())
    }

    /// Start position applied to every media loaded from now on; `None` clears it.
    pub fn set_play_range(&self, start: Option<f64>) {
        self.lock().play_range_start = start.filter(|start| start.is_finite() && *start > 0.0);
    }

    /// Load `song` as the current media without changing the play state:
    /// a stopped or paused player stays paused, a playing one plays it.
    pub fn load_song(&self, song: Song) -> Result<(), PlayerError> {
        self.load(song, false)
    }

    pub fn play_song(&self, song: Song) -> Result<(), PlayerError> {
        self.load(song, true)
    }

    /// Play the playlist's next song. Returns `false` when there is none.
    pub fn play_next(&self) -> Result<bool, PlayerError> {
        match self.playlist.next_song() {
            Some(song) => self.play_song(song).map(|()| true),
            None => Ok(false),
        }
    }

    pub fn play_previous(&self) -> Result<bool, PlayerError> {
        match self.playlist.previous_song() {
            Some(song) => self.play_song(song).map(|()| true),
            None => Ok(false),
        }
    }

    pub fn pause(&self) -> bool {
        let paused = {
            let mut inner = self.lock();
            if inner.state != PlayerState::Playing {
                false
            } else {
                if let Some(handle) = inner.handle.as_mut() {
                    handle.pause();
                }
                inner.state = PlayerState::Paused;
                true
            }
        };
        if paused {
            self.notify_state(PlayerState::Paused);
        }
        paused
    }

    /// Resume the loaded media. Returns `false` when nothing is loaded or it
    /// is already playing.
    pub fn resume(&self) -> bool {
        let resumed = {
            let mut inner = self.lock();
            if inner.shut_down || inner.state == PlayerState::Playing {
                false
            } else if let Some(handle) = inner.handle.as_mut() {
                handle.play();
                inner.state = PlayerState::Playing;
                true
            } else {
                false
            }
        };
        if resumed {
            self.notify_state(PlayerState::Playing);
        }
        resumed
    }

    /// Pause when playing, resume when paused, and start the playlist when stopped.
    pub fn toggle(&self) -> Result<PlayerState, PlayerError> {
        match self.state() {
            PlayerState::Playing => {
                self.pause();
            }
            PlayerState::Paused => {
                if !self.resume() {
                    self.restart()?;
                }
            }
            PlayerState::Stopped => self.restart()?,
        }
        Ok(self.state())
    }

    pub fn stop(&self) {
        let stopped = {
            let mut inner = self.lock();
            if let Some(mut handle) = inner.handle.take() {
                handle.stop();
            }
            inner.last_position = None;
            let was = std::mem::replace(&mut inner.state, PlayerState::Stopped);
            was != PlayerState::Stopped
        };
        if stopped {
            self.notify_state(PlayerState::Stopped);
        }
    }

    pub fn seek(&self, seconds: f64) -> Result<(), PlayerError> {
        let position = {
            let mut inner = self.lock();
            let Some(handle) = inner.handle.as_mut() else {
                return Ok(());
            };
            handle
                .seek(Duration::from_secs_f64(seconds.max(0.0)))
                .map_err(PlayerError::Seek)?;
            let position = handle.position().as_secs_f64();
            inner.last_position = Some(position);
            position
        };
        self.notify_position(position);
        Ok(())
    }

    /// Sample the engine: report the position and advance the playlist once
    /// the current media has played to the end.
    pub fn tick(&self) -> Result<(), PlayerError> {
        let (moved_to, finished) = {
            let mut inner = self.lock();
            if inner.state != PlayerState::Playing {
                return Ok(());
            }
            let Some(handle) = inner.handle.as_ref() else {
                return Ok(());
            };
            let position = handle.position().as_secs_f64();
            let completed = handle.state() == AudioState::Completed;
            let moved = inner
                .last_position
                .map_or(true, |last| (last - position).abs() >= POSITION_EPSILON);
            inner.last_position = Some(position);
            let finished = if completed { inner.current.clone() } else { None };
            (moved.then_some(position), finished)
        };

        if let Some(position) = moved_to {
            self.notify_position(position);
        }
        match finished {
            Some(song) => self.on_media_finished(song),
            None => Ok(()),
        }
    }

    /// Release the engine. Only the first call has an effect.
    pub fn shutdown(&self) -> bool {
        let was_active = {
            let mut inner = self.lock();
            if inner.shut_down {
                return false;
            }
            inner.shut_down = true;
            if let Some(mut handle) = inner.handle.take() {
                handle.stop();
            }
            std::mem::replace(&mut inner.state, PlayerState::Stopped) != PlayerState::Stopped
        };
        self.engine.shutdown();
        if was_active {
            self.notify_state(PlayerState::Stopped);
        }
        tracing::debug!(engine = self.engine.name(), "player shut down");
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    fn load(&self, song: Song, autoplay: bool) -> Result<(), PlayerError> {
        let source = media_source(&song)?;
        let old = {
            let inner = self.lock();
            if inner.shut_down {
                return Err(PlayerError::ShutDown);
            }
            inner.current.clone()
        };

        self.playlist.set_current_song(Some(song.clone()));
        let change = MediaChange {
            old,
            new: Some(song.clone()),
        };
        if let Err(err) = self.media_about_to_change.emit(&change) {
            tracing::warn!(error = %err, "media_about_to_change subscriber failed");
        }

        let duration = song
            .duration_seconds
            .map(|seconds| Duration::from_secs(u64::from(seconds)));
        let loaded = self.engine.load(source, duration);

        let mut inner = self.lock();
        if let Some(mut previous) = inner.handle.take() {
            previous.stop();
        }
        inner.last_position = None;
        let before = inner.state;
        match loaded {
            Ok(mut handle) => {
                handle.set_volume(inner.volume as f32);
                if let Some(start) = inner.play_range_start {
                    if let Err(err) = handle.seek(Duration::from_secs_f64(start)) {
                        tracing::warn!(error = %err, start, "ignoring play range start");
                    }
                }
                let state = if autoplay || before == PlayerState::Playing {
                    handle.play();
                    PlayerState::Playing
                } else {
                    PlayerState::Paused
                };
                inner.handle = Some(handle);
                inner.current = Some(song.clone());
                inner.state = state;
                drop(inner);

                tracing::info!(song = %song.describe(), state = state.label(), "media loaded");
                if state != before {
                    self.notify_state(state);
                }
                Ok(())
            }
            Err(source) => {
                inner.current = None;
                inner.state = PlayerState::Stopped;
                drop(inner);

                tracing::warn!(song = %song.describe(), error = %source, "failed to load media");
                if before != PlayerState::Stopped {
                    self.notify_state(PlayerState::Stopped);
                }
                Err(PlayerError::Load {
                    song: song.describe(),
                    source,
                })
            }
        }
    }

    fn restart(&self) -> Result<(), PlayerError> {
        let song = self
            .current_song()
            .or_else(|| self.playlist.current_song())
            .or_else(|| self.playlist.next_song());
        match song {
            Some(song) => self.play_song(song),
            None => Ok(()),
        }
    }

    fn on_media_finished(&self, song: Song) -> Result<(), PlayerError> {
        tracing::debug!(song = %song.describe(), "media finished");
        if let Err(err) = self.media_finished.emit(&song) {
            tracing::warn!(error = %err, "media_finished subscriber failed");
        }
        match self.playlist.next_song() {
            Some(next) => self.play_song(next),
            None => {
                self.stop();
                Ok(())
            }
        }
    }

    fn notify_state(&self, state: PlayerState) {
        if let Err(err) = self.state_changed.emit(&state) {
            tracing::warn!(error = %err, "state_changed subscriber failed");
        }
    }

    fn notify_position(&self, position: f64) {
        if let Err(err) = self.position_changed.emit(&position) {
            tracing::warn!(error = %err, "position_changed subscriber failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlayerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn media_source(song: &Song) -> Result<AudioSource, PlayerError> {
    match song.url.as_deref() {
        Some(url) if url.contains("://") => Ok(AudioSource::Url(url.to_string())),
        Some(path) if !path.is_empty() => Ok(AudioSource::File(PathBuf::from(path))),
        _ => Err(PlayerError::NoMedia {
            song: song.describe(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_audio::NullAudioEngine;
    use cadence_core::PlaybackMode;

    fn song(id: &str) -> Song {
        Song::new("test", id, id, "artist").with_url(format!("test://{id}"))
    }

    fn player(ids: &[&str]) -> Arc<Player> {
        let playlist = Arc::new(Playlist::new());
        playlist.init_from(ids.iter().map(|id| song(id)).collect());
        Arc::new(Player::new(Arc::new(NullAudioEngine::new()), playlist))
    }

    fn record<T: Clone + Send + 'static>(signal: &Signal<T>) -> Arc<Mutex<Vec<T>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        signal.connect(move |value: &T| {
            sink.lock().unwrap().push(value.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn play_song_announces_change_then_plays() {
        let player = player(&["one", "two"]);
        let changes = record(&player.media_about_to_change);
        let states = record(&player.state_changed);

        player.play_song(song("one")).unwrap();
        player.play_song(song("two")).unwrap();

        let changes = changes.lock().unwrap();
        assert_eq!(changes[0].old, None);
        assert_eq!(changes[1].old, Some(song("one")));
        assert_eq!(changes[1].new, Some(song("two")));
        assert_eq!(*states.lock().unwrap(), vec![PlayerState::Playing]);
        assert_eq!(player.playlist().current_song(), Some(song("two")));
    }

    #[test]
    fn load_song_keeps_player_paused() {
        let player = player(&["one"]);
        player.load_song(song("one")).unwrap();
        assert_eq!(player.state(), PlayerState::Paused);
        assert_eq!(player.current_song(), Some(song("one")));
        assert!(player.resume());
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[test]
    fn play_range_seeks_new_media() {
        let player = player(&[]);
        player.set_play_range(Some(15.0));
        player.load_song(song("one").with_duration(200)).unwrap();
        assert!((player.position() - 15.0).abs() < 0.01);

        player.set_play_range(None);
        player.load_song(song("two").with_duration(200)).unwrap();
        assert!(player.position() < 0.01);
    }

    #[test]
    fn song_without_media_is_rejected() {
        let player = player(&[]);
        let bare = Song::new("test", "bare", "Bare", "");
        assert!(matches!(
            player.play_song(bare),
            Err(PlayerError::NoMedia { .. })
        ));
    }

    #[test]
    fn subscribers_can_call_back_into_player() {
        let player = player(&["one", "two"]);
        let weak = Arc::downgrade(&player);
        player.media_about_to_change.connect(move |_: &MediaChange| {
            if let Some(player) = weak.upgrade() {
                player.pause();
                let _ = player.volume();
            }
            Ok(())
        });
        player.play_song(song("one")).unwrap();
        assert_eq!(player.current_song(), Some(song("one")));
    }

    #[test]
    fn tick_advances_sequentially_then_stops() {
        let player = player(&[]);
        player
            .playlist()
            .init_from(vec![song("one").with_duration(0), song("two").with_duration(0)]);
        let finished = record(&player.media_finished);

        player.play_song(song("one").with_duration(0)).unwrap();
        player.tick().unwrap();
        assert_eq!(player.current_song().map(|s| s.id.0), Some("two".to_string()));
        assert_eq!(player.state(), PlayerState::Playing);

        player.tick().unwrap();
        assert_eq!(player.state(), PlayerState::Stopped);
        let finished: Vec<String> = finished.lock().unwrap().iter().map(|s| s.id.0.clone()).collect();
        assert_eq!(finished, vec!["one", "two"]);
    }

    #[test]
    fn tick_repeats_in_one_loop_mode() {
        let player = player(&[]);
        player.playlist().init_from(vec![song("one").with_duration(0)]);
        player.playlist().set_playback_mode(PlaybackMode::OneLoop);
        let changes = record(&player.media_about_to_change);

        player.play_song(song("one").with_duration(0)).unwrap();
        player.tick().unwrap();
        assert_eq!(changes.lock().unwrap().len(), 2);
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[test]
    fn tick_reports_position_only_when_it_moves() {
        let player = player(&["one"]);
        let positions = record(&player.position_changed);
        player.load_song(song("one")).unwrap();
        player.tick().unwrap();
        assert!(positions.lock().unwrap().is_empty());

        player.resume();
        player.tick().unwrap();
        assert_eq!(positions.lock().unwrap().len(), 1);
    }

    #[test]
    fn toggle_starts_playlist_when_stopped() {
        let player = player(&["one", "two"]);
        assert_eq!(player.toggle().unwrap(), PlayerState::Playing);
        assert_eq!(player.current_song(), Some(song("one")));
        assert_eq!(player.toggle().unwrap(), PlayerState::Paused);
        player.stop();
        assert_eq!(player.toggle().unwrap(), PlayerState::Playing);
        assert_eq!(player.current_song(), Some(song("one")));
    }

    #[test]
    fn volume_is_clamped() {
        let player = player(&[]);
        player.set_volume(1.7);
        assert_eq!(player.volume(), 1.0);
        player.set_volume(-2.0);
        assert_eq!(player.volume(), 0.0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let player = player(&["one"]);
        player.play_song(song("one")).unwrap();
        let states = record(&player.state_changed);

        assert!(player.shutdown());
        assert!(!player.shutdown());
        assert_eq!(*states.lock().unwrap(), vec![PlayerState::Stopped]);
        assert!(matches!(
            player.play_song(song("one")),
            Err(PlayerError::ShutDown)
        ));
    }
}
