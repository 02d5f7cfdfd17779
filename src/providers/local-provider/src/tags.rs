use lofty::{Accessor, AudioFile, ItemKey, Probe, TaggedFileExt};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ParsedTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<u32>,
}

/// Read embedded tags. Files lofty cannot probe yield empty tags.
pub fn parse_tags(path: &Path) -> ParsedTags {
    let tagged = match Probe::open(path).and_then(|p| p.read()) {
        Ok(tagged) => tagged,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "no readable tags");
            return ParsedTags::default();
        }
    };

    let tag = tagged.primary_tag().or_else(|| tagged.first_tag());
    let duration = tagged.properties().duration().as_secs();

    ParsedTags {
        title: tag.and_then(|t| t.get_string(&ItemKey::TrackTitle).map(str::to_string)),
        artist: tag.and_then(|t| t.artist().map(|s| s.to_string())),
        album: tag.and_then(|t| t.album().map(|s| s.to_string())),
        duration_seconds: (duration > 0).then(|| u32::try_from(duration).unwrap_or(u32::MAX)),
    }
}
