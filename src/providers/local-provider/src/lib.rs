//! Built-in provider for music files on local disk.
//!
//! Song ids are canonical file paths, so a reference looks like
//! `cadence://local/songs//home/me/Music/a.mp3`. Lyrics come from a `.lrc`
//! file next to the audio file.

mod scan;
mod tags;

use cadence_core::{
    Plugin, PluginContext, PluginError, Provider, ProviderCapabilities, ProviderError,
    ProviderResult, Song, SongId,
};
use scan::{is_supported_extension, scan_library, song_for, LibraryIndex};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

pub const PROVIDER_ID: &str = "local";

#[derive(Debug, Clone)]
pub struct LocalProvider {
    roots: Vec<PathBuf>,
    index: Arc<RwLock<LibraryIndex>>,
}

impl LocalProvider {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let index = scan_library(&roots);
        Self {
            roots,
            index: Arc::new(RwLock::new(index)),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Walk the roots again, replacing the index.
    pub fn rescan(&self) -> usize {
        let index = scan_library(&self.roots);
        let count = index.songs.len();
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
        count
    }

    /// Every indexed song, ordered by path.
    pub fn songs(&self) -> Vec<Song> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.songs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .songs
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Songs added to disk after the last scan are still found as long as
    /// they live under one of the roots.
    fn song_on_disk(&self, id: &SongId) -> Option<Song> {
        let path = Path::new(&id.0);
        let supported = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(is_supported_extension);
        if !supported || !path.is_file() {
            return None;
        }
        self.roots.iter().find_map(|root| {
            let root = root.canonicalize().ok()?;
            song_for(path, &root)
        })
    }
}

impl Provider for LocalProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Local Library"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            references: true,
            lyrics: true,
        }
    }

    fn song(&self, id: &SongId) -> ProviderResult<Song> {
        let indexed = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index.songs.get(id).cloned()
        };
        indexed
            .or_else(|| self.song_on_disk(id))
            .ok_or_else(|| ProviderError::NotFound {
                entity: id.0.clone(),
            })
    }

    fn lyrics(&self, id: &SongId) -> ProviderResult<String> {
        let song = self.song(id)?;
        let lrc = Path::new(&song.id.0).with_extension("lrc");
        fs::read_to_string(&lrc).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => ProviderError::NotFound {
                entity: lrc.display().to_string(),
            },
            _ => ProviderError::Other {
                message: format!("failed to read {}: {err}", lrc.display()),
            },
        })
    }
}

/// Registers a [`LocalProvider`] over `library.music_dirs`.
#[derive(Debug, Default)]
pub struct LocalLibraryPlugin;

impl Plugin for LocalLibraryPlugin {
    fn name(&self) -> &str {
        "local-library"
    }

    fn enable(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let roots = ctx.config().library.music_dirs.clone();
        if roots.is_empty() {
            tracing::info!("no music directories configured; local library is empty");
        }
        ctx.register_provider(Arc::new(LocalProvider::new(roots)));
        Ok(())
    }

    fn disable(&self, ctx: &PluginContext) {
        ctx.unregister_provider(PROVIDER_ID);
    }
}
