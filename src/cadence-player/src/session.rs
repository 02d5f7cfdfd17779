//! Playback session persistence.
//!
//! The session is written once at shutdown and read once at startup. Songs
//! are stored as reference strings so a session survives provider objects
//! that only live for one process; references that no longer resolve are
//! dropped on restore.

use crate::player::{MediaChange, Player, PlayerState};
use cadence_core::{reverse_line, AppDirs, PlaybackMode, ReferenceResolver, Song};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Maximum number of playlist entries accepted from a state file.
const MAX_PLAYLIST_ENTRIES: usize = 10_000;

/// Maximum accepted state file size (10 MiB).
const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read state file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("malformed state file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("state file too large ({size} bytes, max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("state playlist has too many entries ({count}, max {max})")]
    TooManyEntries { count: usize, max: usize },
}

impl SessionError {
    /// Whether the file exists but cannot be trusted.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            SessionError::Malformed { .. }
                | SessionError::FileTooLarge { .. }
                | SessionError::TooManyEntries { .. }
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Snapshot of a playback session as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub volume: f64,
    pub playback_mode: PlaybackMode,
    /// Player state at dump time. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PlayerState>,
    /// Reference of the current song.
    pub song: Option<String>,
    pub position: Option<f64>,
    pub playlist: Vec<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            volume: 1.0,
            playback_mode: PlaybackMode::default(),
            state: None,
            song: None,
            position: None,
            playlist: Vec::new(),
        }
    }
}

impl SessionState {
    /// Snapshot the live player and its playlist without touching either.
    ///
    /// Songs the resolver cannot reverse are left out with a warning.
    pub fn capture(player: &Player, resolver: &dyn ReferenceResolver) -> Self {
        let song = player
            .current_song()
            .and_then(|song| reverse_or_warn(resolver, &song));
        let position = song.as_ref().map(|_| player.position());
        let playlist = player
            .playlist()
            .list()
            .iter()
            .filter_map(|song| reverse_or_warn(resolver, song))
            .collect();

        Self {
            volume: player.volume(),
            playback_mode: player.playlist().playback_mode(),
            state: Some(player.state()),
            song,
            position,
            playlist,
        }
    }
}

fn reverse_or_warn(resolver: &dyn ReferenceResolver, song: &Song) -> Option<String> {
    match reverse_line(resolver, song) {
        Ok(line) => Some(line),
        Err(err) => {
            tracing::warn!(song = %song.describe(), error = %err, "skipping song in session dump");
            None
        }
    }
}

/// Outcome of [`SessionStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyReport {
    /// Playlist entries that resolved and were installed.
    pub restored: usize,
    /// Playlist entries dropped because they no longer resolve.
    pub dropped: usize,
    /// Whether the current song was preloaded.
    pub preloaded: bool,
}

/// Reads and writes the single session state file.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    tmp_path: PathBuf,
    corrupt_path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        Self {
            tmp_path: dir.join(format!("{file_name}.tmp")),
            corrupt_path: dir.join(format!("{stem}.corrupt.json")),
            path,
        }
    }

    pub fn for_dirs(dirs: &AppDirs) -> Self {
        Self::new(dirs.state_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn corrupt_path(&self) -> &Path {
        &self.corrupt_path
    }

    /// Capture the live session and persist it, replacing the previous file.
    pub fn dump(
        &self,
        player: &Player,
        resolver: &dyn ReferenceResolver,
    ) -> SessionResult<SessionState> {
        let state = SessionState::capture(player, resolver);
        self.write(&state)?;
        Ok(state)
    }

    /// Write `state` through a temporary file renamed over the state file.
    pub fn write(&self, state: &SessionState) -> SessionResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SessionError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let write_err = |source| SessionError::Write {
            path: self.tmp_path.clone(),
            source,
        };
        let body = serde_json::to_vec_pretty(state).map_err(|e| write_err(io::Error::other(e)))?;
        let mut file = fs::File::create(&self.tmp_path).map_err(write_err)?;
        file.write_all(&body).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path).map_err(|source| SessionError::Write {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(
            songs = state.playlist.len(),
            path = %self.path.display(),
            "saved session state"
        );
        Ok(())
    }

    /// Read the state file. `Ok(None)` when there is none.
    pub fn try_load(&self) -> SessionResult<Option<SessionState>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SessionError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if metadata.len() > MAX_STATE_FILE_SIZE {
            return Err(SessionError::FileTooLarge {
                size: metadata.len(),
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let file = fs::File::open(&self.path).map_err(|source| SessionError::Read {
            path: self.path.clone(),
            source,
        })?;
        let state: SessionState = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            SessionError::Malformed {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;

        if state.playlist.len() > MAX_PLAYLIST_ENTRIES {
            return Err(SessionError::TooManyEntries {
                count: state.playlist.len(),
                max: MAX_PLAYLIST_ENTRIES,
            });
        }
        if !state.volume.is_finite() {
            return Err(SessionError::Malformed {
                path: self.path.clone(),
                reason: "volume is not a finite number".into(),
            });
        }

        tracing::debug!(
            songs = state.playlist.len(),
            path = %self.path.display(),
            "loaded session state"
        );
        Ok(Some(state))
    }

    /// Read the state file, treating a malformed file as absent.
    ///
    /// A malformed file is logged and moved aside so the next dump starts clean.
    pub fn load(&self) -> Option<SessionState> {
        match self.try_load() {
            Ok(state) => state,
            Err(err) if err.is_malformed() => {
                tracing::error!(
                    error = %err,
                    path = %self.path.display(),
                    "invalid state file; starting with an empty session"
                );
                if let Err(move_err) = fs::rename(&self.path, &self.corrupt_path) {
                    tracing::warn!(error = %move_err, "failed to preserve malformed state file");
                }
                None
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to read state file; starting with an empty session");
                None
            }
        }
    }

    /// Restore `state` into the live player.
    ///
    /// Unresolvable playlist entries are dropped in order. When the current
    /// song resolves it is loaded paused at the saved position, and the first
    /// media change after that preload resumes playback from the start.
    pub fn apply(
        state: &SessionState,
        player: &Arc<Player>,
        resolver: &Arc<dyn ReferenceResolver>,
    ) -> ApplyReport {
        let playlist = player.playlist();
        player.set_volume(state.volume);
        playlist.set_playback_mode(state.playback_mode);

        let mut report = ApplyReport::default();
        let songs: Vec<Song> = state
            .playlist
            .iter()
            .filter_map(|reference| match resolver.resolve(reference) {
                Ok(song) => Some(song),
                Err(err) => {
                    tracing::debug!(reference = %reference, error = %err, "dropping playlist entry");
                    report.dropped += 1;
                    None
                }
            })
            .collect();
        report.restored = songs.len();
        if !songs.is_empty() {
            playlist.init_from(songs);
        }

        let Some(reference) = state.song.as_deref() else {
            return report;
        };
        let song = match resolver.resolve(reference) {
            Ok(song) => song,
            Err(err) => {
                tracing::info!(reference = %reference, error = %err, "previous song is gone; not preloading");
                return report;
            }
        };

        let hook = ResumeHook::arm(player, resolver, &song);
        player.pause();
        player.set_play_range(state.position);
        match player.load_song(song) {
            Ok(()) => report.preloaded = true,
            Err(err) => {
                tracing::warn!(error = %err, "failed to preload previous song");
                hook.disarm(player);
                player.set_play_range(None);
            }
        }

        tracing::info!(
            restored = report.restored,
            dropped = report.dropped,
            preloaded = report.preloaded,
            "session restored"
        );
        report
    }
}

/// One-shot `media_about_to_change` subscriber installed by a restore.
///
/// It lets exactly the preload through: no previous media and an incoming
/// song that reverses to the restored reference. On any other transition it
/// disconnects itself, clears the play range and resumes.
struct ResumeHook {
    slot: cadence_core::SlotId,
}

impl ResumeHook {
    fn arm(player: &Arc<Player>, resolver: &Arc<dyn ReferenceResolver>, song: &Song) -> Self {
        let remembered = resolver.reverse(song).ok();
        let resolver = Arc::clone(resolver);
        let slot = Arc::new(std::sync::OnceLock::new());
        let own_slot = Arc::clone(&slot);

        let id = player.media_about_to_change.connect_weak(
            player,
            move |player: &Player, change: &MediaChange| {
                let incoming = change
                    .new
                    .as_ref()
                    .and_then(|song| resolver.reverse(song).ok());
                let is_preload =
                    change.old.is_none() && remembered.is_some() && incoming == remembered;
                if is_preload {
                    return Ok(());
                }
                if let Some(id) = own_slot.get() {
                    player.media_about_to_change.disconnect(*id);
                }
                player.set_play_range(None);
                player.resume();
                tracing::debug!("resume hook fired");
                Ok(())
            },
        );
        let _ = slot.set(id);
        Self { slot: id }
    }

    fn disarm(self, player: &Player) {
        player.media_about_to_change.disconnect(self.slot);
    }
}
