use cadence_core::{PlaybackMode, Signal, Song};
use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct PlaylistInner {
    songs: Vec<Song>,
    current: Option<usize>,
    mode: PlaybackMode,
}

impl PlaylistInner {
    fn position_of(&self, song: &Song) -> Option<usize> {
        self.songs.iter().position(|entry| entry.same_entry(song))
    }

    fn current_song(&self) -> Option<Song> {
        self.current.and_then(|idx| self.songs.get(idx)).cloned()
    }

    fn random_index_except(&self, current: Option<usize>) -> Option<usize> {
        let len = self.songs.len();
        match (len, current) {
            (0, _) => None,
            (1, _) => Some(0),
            (_, None) => Some(rand::thread_rng().gen_range(0..len)),
            (_, Some(current)) => {
                // Draw from the other len - 1 entries.
                let pick = rand::thread_rng().gen_range(0..len - 1);
                Some(if pick >= current { pick + 1 } else { pick })
            }
        }
    }
}

/// Ordered list of songs with a current entry and a playback mode.
///
/// Changing the current song emits [`Playlist::song_changed`] once the
/// internal lock has been released.
#[derive(Debug)]
pub struct Playlist {
    inner: Mutex<PlaylistInner>,
    pub song_changed: Signal<Option<Song>>,
}

impl Default for Playlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Playlist {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PlaylistInner::default()),
            song_changed: Signal::new("playlist.song_changed"),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().songs.is_empty()
    }

    pub fn list(&self) -> Vec<Song> {
        self.lock().songs.clone()
    }

    pub fn contains(&self, song: &Song) -> bool {
        self.lock().position_of(song).is_some()
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        self.lock().mode
    }

    pub fn set_playback_mode(&self, mode: PlaybackMode) {
        let mut inner = self.lock();
        if inner.mode != mode {
            tracing::debug!(mode = mode.label(), "playback mode changed");
            inner.mode = mode;
        }
    }

    /// Replace every entry. The current song is cleared without notification.
    pub fn init_from(&self, songs: Vec<Song>) {
        let mut inner = self.lock();
        inner.songs = songs;
        inner.current = None;
    }

    /// Append `song` unless an entry for it already exists. Returns whether it was added.
    pub fn add(&self, song: Song) -> bool {
        let mut inner = self.lock();
        if inner.position_of(&song).is_some() {
            return false;
        }
        inner.songs.push(song);
        true
    }

    /// Remove the entry for `song`. Removing the current song clears it.
    pub fn remove(&self, song: &Song) -> bool {
        let cleared = {
            let mut inner = self.lock();
            let Some(idx) = inner.position_of(song) else {
                return false;
            };
            inner.songs.remove(idx);
            match inner.current {
                Some(current) if idx < current => {
                    inner.current = Some(current - 1);
                    false
                }
                Some(current) if idx == current => {
                    inner.current = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.notify(None);
        }
        true
    }

    pub fn clear(&self) {
        let had_current = {
            let mut inner = self.lock();
            inner.songs.clear();
            inner.current.take().is_some()
        };
        if had_current {
            self.notify(None);
        }
    }

    pub fn current_song(&self) -> Option<Song> {
        self.lock().current_song()
    }

    /// Make `song` current, inserting it after the current entry when it is
    /// not in the list yet. `None` clears the current song.
    pub fn set_current_song(&self, song: Option<Song>) {
        {
            let mut inner = self.lock();
            match &song {
                Some(song) => {
                    let idx = match inner.position_of(song) {
                        Some(idx) => idx,
                        None => {
                            let at = inner.current.map(|idx| idx + 1).unwrap_or(inner.songs.len());
                            inner.songs.insert(at, song.clone());
                            at
                        }
                    };
                    inner.current = Some(idx);
                }
                None => inner.current = None,
            }
        }
        self.notify(song);
    }

    /// Song that follows the current one under the playback mode.
    pub fn next_song(&self) -> Option<Song> {
        let inner = self.lock();
        let len = inner.songs.len();
        if len == 0 {
            return None;
        }
        let idx = match (inner.mode, inner.current) {
            (PlaybackMode::Random, current) => inner.random_index_except(current),
            (_, None) => Some(0),
            (PlaybackMode::OneLoop, current) => current,
            (PlaybackMode::Sequential, Some(idx)) => (idx + 1 < len).then_some(idx + 1),
            (PlaybackMode::Loop, Some(idx)) => Some((idx + 1) % len),
        };
        idx.and_then(|idx| inner.songs.get(idx)).cloned()
    }

    /// Song that precedes the current one under the playback mode.
    pub fn previous_song(&self) -> Option<Song> {
        let inner = self.lock();
        let len = inner.songs.len();
        if len == 0 {
            return None;
        }
        let idx = match (inner.mode, inner.current) {
            (PlaybackMode::Random, current) => inner.random_index_except(current),
            (_, None) => Some(len - 1),
            (PlaybackMode::OneLoop, current) => current,
            (PlaybackMode::Sequential, Some(idx)) => idx.checked_sub(1),
            (PlaybackMode::Loop, Some(idx)) => Some((idx + len - 1) % len),
        };
        idx.and_then(|idx| inner.songs.get(idx)).cloned()
    }

    fn notify(&self, song: Option<Song>) {
        if let Err(err) = self.song_changed.emit(&song) {
            tracing::warn!(error = %err, "song_changed subscriber failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaylistInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn song(id: &str) -> Song {
        Song::new("test", id, id, "artist")
    }

    fn playlist(ids: &[&str], mode: PlaybackMode) -> Playlist {
        let playlist = Playlist::new();
        playlist.init_from(ids.iter().map(|id| song(id)).collect());
        playlist.set_playback_mode(mode);
        playlist
    }

    fn ids(songs: &[Song]) -> Vec<String> {
        songs.iter().map(|song| song.id.0.clone()).collect()
    }

    #[test]
    fn add_skips_duplicates() {
        let playlist = Playlist::new();
        assert!(playlist.add(song("one")));
        assert!(!playlist.add(song("one")));
        assert_eq!(playlist.len(), 1);
    }

    #[test]
    fn set_current_inserts_unknown_song_after_current() {
        let playlist = playlist(&["one", "two"], PlaybackMode::Sequential);
        playlist.set_current_song(Some(song("one")));
        playlist.set_current_song(Some(song("new")));
        assert_eq!(ids(&playlist.list()), vec!["one", "new", "two"]);
        assert_eq!(playlist.current_song(), Some(song("new")));
    }

    #[test]
    fn set_current_emits_song_changed() {
        let playlist = playlist(&["one"], PlaybackMode::Sequential);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        playlist.song_changed.connect(move |song: &Option<Song>| {
            sink.lock().unwrap().push(song.as_ref().map(|s| s.id.0.clone()));
            Ok(())
        });

        playlist.set_current_song(Some(song("one")));
        playlist.clear();
        assert_eq!(*seen.lock().unwrap(), vec![Some("one".to_string()), None]);
    }

    #[test]
    fn sequential_stops_at_end_and_loop_wraps() {
        let sequential = playlist(&["one", "two"], PlaybackMode::Sequential);
        assert_eq!(sequential.next_song(), Some(song("one")));
        sequential.set_current_song(Some(song("two")));
        assert_eq!(sequential.next_song(), None);
        assert_eq!(sequential.previous_song(), Some(song("one")));

        let looping = playlist(&["one", "two"], PlaybackMode::Loop);
        looping.set_current_song(Some(song("two")));
        assert_eq!(looping.next_song(), Some(song("one")));
        looping.set_current_song(Some(song("one")));
        assert_eq!(looping.previous_song(), Some(song("two")));
    }

    #[test]
    fn one_loop_repeats_current() {
        let playlist = playlist(&["one", "two"], PlaybackMode::OneLoop);
        playlist.set_current_song(Some(song("two")));
        assert_eq!(playlist.next_song(), Some(song("two")));
        assert_eq!(playlist.previous_song(), Some(song("two")));
    }

    #[test]
    fn random_never_repeats_current_when_it_can_avoid_it() {
        let playlist = playlist(&["one", "two", "three"], PlaybackMode::Random);
        playlist.set_current_song(Some(song("two")));
        for _ in 0..50 {
            let next = playlist.next_song().unwrap();
            assert_ne!(next.id.0, "two");
        }
    }

    #[test]
    fn removing_before_current_keeps_current() {
        let playlist = playlist(&["one", "two", "three"], PlaybackMode::Sequential);
        playlist.set_current_song(Some(song("three")));
        assert!(playlist.remove(&song("one")));
        assert_eq!(playlist.current_song(), Some(song("three")));
        assert!(playlist.remove(&song("three")));
        assert_eq!(playlist.current_song(), None);
        assert!(!playlist.remove(&song("missing")));
    }
}
