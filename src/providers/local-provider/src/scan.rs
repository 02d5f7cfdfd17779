use crate::tags::parse_tags;
use crate::PROVIDER_ID;
use cadence_core::{Song, SongId};
use path_clean::PathClean;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Songs found under the library roots, keyed by canonical path.
#[derive(Debug, Clone, Default)]
pub struct LibraryIndex {
    pub songs: BTreeMap<SongId, Song>,
}

pub fn is_supported_extension(ext: &str) -> bool {
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "mp3" | "m4a" | "flac" | "wav" | "ogg" | "opus"
    )
}

fn canonicalize_within_root(path: &Path, root: &Path) -> Option<PathBuf> {
    let canon = path.canonicalize().ok()?.clean();
    canon.starts_with(root).then_some(canon)
}

/// Walk every root. Missing roots and unreadable entries are logged and skipped.
pub fn scan_library(roots: &[PathBuf]) -> LibraryIndex {
    let mut index = LibraryIndex::default();
    for root in roots {
        let Ok(root) = root.canonicalize().map(|p| p.clean()) else {
            tracing::warn!(root = %root.display(), "music directory does not exist; skipping");
            continue;
        };
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(root = %root.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let supported = entry
                .path()
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(is_supported_extension);
            if !supported {
                continue;
            }
            if let Some(song) = song_for(entry.path(), &root) {
                index.songs.insert(song.id.clone(), song);
            }
        }
    }
    tracing::info!(songs = index.songs.len(), roots = roots.len(), "library scanned");
    index
}

/// Build the song for a file inside `root`. Artist and album fall back to
/// the `<artist>/<album>/<file>` directory layout when tags are missing.
pub fn song_for(path: &Path, root: &Path) -> Option<Song> {
    let canonical = canonicalize_within_root(path, root)?;
    let relative = canonical.strip_prefix(root).ok()?;

    let mut dirs: Vec<String> = relative
        .parent()
        .map(|parent| {
            parent
                .components()
                .filter_map(|c| c.as_os_str().to_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let inferred_album = if dirs.len() >= 2 { dirs.pop() } else { None };
    let inferred_artist = dirs.pop().unwrap_or_else(|| "Unknown Artist".to_string());

    let file_stem = canonical
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown")
        .to_string();

    let tags = parse_tags(&canonical);
    let location = canonical.to_string_lossy().into_owned();
    let mut song = Song::new(
        PROVIDER_ID,
        location.clone(),
        tags.title.unwrap_or(file_stem),
        tags.artist.unwrap_or(inferred_artist),
    )
    .with_url(format!("file://{location}"));
    song.album = tags.album.or(inferred_album);
    song.duration_seconds = tags.duration_seconds;
    Some(song)
}
