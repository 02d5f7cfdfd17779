//! Reference strings for songs.
//!
//! A reference is an opaque, provider-qualified string naming one song. Only
//! a [`ReferenceResolver`] produces ("reverses") and consumes ("resolves")
//! them; everything else treats them as text. The [`ProviderRegistry`] is the
//! resolver used at runtime and renders references as
//! `cadence://<provider>/songs/<id>`.

use crate::models::{Song, SongId};
use crate::provider::{Provider, ProviderError};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

pub const REFERENCE_SCHEME: &str = "cadence";

const SONGS_SEGMENT: &str = "/songs/";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("songs from provider '{provider}' cannot be exported as references")]
    NotReversible { provider: String },
    #[error("no provider recognizes reference '{reference}'")]
    NotFound { reference: String },
    #[error("provider failed to resolve '{reference}': {source}")]
    Provider {
        reference: String,
        #[source]
        source: ProviderError,
    },
}

/// Turns songs into reference strings and back.
///
/// Both directions can fail; callers must handle the failure path.
pub trait ReferenceResolver: Send + Sync {
    fn reverse(&self, song: &Song) -> Result<String, ResolveError>;

    fn resolve(&self, reference: &str) -> Result<Song, ResolveError>;
}

/// Registry of the providers contributed by plugins.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<BTreeMap<String, Arc<dyn Provider>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing (and returning) one with the same id.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Option<Arc<dyn Provider>> {
        let id = provider.id().to_string();
        tracing::debug!(provider = %id, "registering provider");
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, provider)
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReferenceResolver for ProviderRegistry {
    /// Songs from providers that are no longer registered still reverse, so a
    /// playlist survives a plugin being disabled for one session.
    fn reverse(&self, song: &Song) -> Result<String, ResolveError> {
        if let Some(provider) = self.get(&song.provider_id) {
            if !provider.capabilities().supports_references() {
                return Err(ResolveError::NotReversible {
                    provider: song.provider_id.clone(),
                });
            }
        }
        Ok(format_reference(&song.provider_id, &song.id))
    }

    fn resolve(&self, reference: &str) -> Result<Song, ResolveError> {
        let not_found = || ResolveError::NotFound {
            reference: reference.to_string(),
        };
        let (provider_id, song_id) = parse_reference(reference).ok_or_else(not_found)?;
        let provider = self.get(provider_id).ok_or_else(not_found)?;
        if !provider.capabilities().supports_references() {
            return Err(not_found());
        }
        match provider.song(&SongId::new(song_id)) {
            Ok(song) => Ok(song),
            Err(ProviderError::NotFound { .. }) => Err(not_found()),
            Err(source) => Err(ResolveError::Provider {
                reference: reference.to_string(),
                source,
            }),
        }
    }
}

/// Render a reference with a trailing human-readable comment.
///
/// The comment is ignored when the line is resolved again.
pub fn reverse_line(resolver: &dyn ReferenceResolver, song: &Song) -> Result<String, ResolveError> {
    let reference = resolver.reverse(song)?;
    Ok(format!("{reference}  # {}", song.describe()))
}

fn format_reference(provider_id: &str, id: &SongId) -> String {
    format!("{REFERENCE_SCHEME}://{provider_id}{SONGS_SEGMENT}{}", id.0)
}

fn parse_reference(reference: &str) -> Option<(&str, &str)> {
    let line = reference
        .split_once(" #")
        .map(|(head, _)| head)
        .unwrap_or(reference)
        .trim();
    let rest = line
        .strip_prefix(REFERENCE_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))?;
    let (provider, id) = rest.split_once(SONGS_SEGMENT)?;
    if provider.is_empty() || provider.contains('/') || id.is_empty() {
        return None;
    }
    Some((provider, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderCapabilities, ProviderResult};

    struct StaticProvider {
        id: &'static str,
        references: bool,
        songs: Vec<Song>,
    }

    impl Provider for StaticProvider {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            "Static"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                references: self.references,
                lyrics: false,
            }
        }

        fn song(&self, id: &SongId) -> ProviderResult<Song> {
            self.songs
                .iter()
                .find(|song| &song.id == id)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound {
                    entity: id.0.clone(),
                })
        }
    }

    fn registry() -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(StaticProvider {
            id: "static",
            references: true,
            songs: vec![
                Song::new("static", "42", "Answer", "Deep Thought"),
                Song::new("static", "/music/a b.flac", "Path", "Local"),
            ],
        }));
        registry
    }

    #[test]
    fn reverse_then_resolve_returns_same_song() {
        let registry = registry();
        let song = Song::new("static", "42", "Answer", "Deep Thought");
        let reference = registry.reverse(&song).unwrap();
        assert_eq!(reference, "cadence://static/songs/42");
        assert_eq!(registry.resolve(&reference).unwrap(), song);
    }

    #[test]
    fn resolve_accepts_commented_lines_and_slashy_ids() {
        let registry = registry();
        let song = Song::new("static", "/music/a b.flac", "Path", "Local");
        let line = reverse_line(&registry, &song).unwrap();
        assert!(line.ends_with("# Path - Local"));
        assert_eq!(registry.resolve(&line).unwrap().id, song.id);
    }

    #[test]
    fn unknown_provider_or_song_is_not_found() {
        let registry = registry();
        for reference in [
            "cadence://missing/songs/1",
            "cadence://static/songs/7",
            "http://static/songs/42",
            "cadence://static/42",
            "",
        ] {
            assert!(
                matches!(registry.resolve(reference), Err(ResolveError::NotFound { .. })),
                "{reference} should not resolve"
            );
        }
    }

    #[test]
    fn provider_without_reference_support_is_not_reversible() {
        let registry = registry();
        registry.register(Arc::new(StaticProvider {
            id: "radio",
            references: false,
            songs: vec![Song::new("radio", "1", "Live", "")],
        }));
        let song = Song::new("radio", "1", "Live", "");
        assert!(matches!(
            registry.reverse(&song),
            Err(ResolveError::NotReversible { .. })
        ));
        assert!(registry.resolve("cadence://radio/songs/1").is_err());
    }

    #[test]
    fn unregistered_provider_still_reverses() {
        let registry = registry();
        registry.unregister("static");
        let song = Song::new("static", "42", "Answer", "Deep Thought");
        assert_eq!(
            registry.reverse(&song).unwrap(),
            "cadence://static/songs/42"
        );
        assert!(registry.resolve("cadence://static/songs/42").is_err());
    }
}
