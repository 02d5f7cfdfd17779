use std::{
    fmt,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use thiserror::Error;

/// Audio playback errors.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio backend unavailable: {0}")]
    Backend(String),
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
    #[error("cannot seek to {requested:?}, media is {duration:?} long")]
    SeekOutOfRange {
        requested: Duration,
        duration: Duration,
    },
    #[error("audio engine has been shut down")]
    ShutDown,
    #[error("{0}")]
    Other(String),
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Abstract audio source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// A URL (local file via `file://` or remote). Backends may support a subset.
    Url(String),
    /// A local file path.
    File(PathBuf),
}

impl AudioSource {
    pub fn describe(&self) -> String {
        match self {
            AudioSource::Url(url) => url.clone(),
            AudioSource::File(path) => path.display().to_string(),
        }
    }
}

/// Runtime playback state for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioState {
    /// Loaded but not started, or paused.
    Paused,
    Playing,
    Completed,
    Stopped,
}

/// Control surface of one loaded media.
pub trait AudioHandle: Send {
    fn state(&self) -> AudioState;

    fn play(&mut self);

    fn pause(&mut self);

    fn seek(&mut self, position: Duration) -> AudioResult<()>;

    fn position(&self) -> Duration;

    /// Media length when the backend knows it.
    fn duration(&self) -> Option<Duration>;

    /// Volume in `[0.0, 1.0]`.
    fn set_volume(&mut self, volume: f32);

    /// Stop playback and release the media. Further calls are no-ops.
    fn stop(&mut self);
}

/// Audio backend interface.
pub trait AudioEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Load `source` paused at position zero.
    ///
    /// `duration` is a hint from the song metadata for backends that cannot
    /// probe it themselves.
    fn load(
        &self,
        source: AudioSource,
        duration: Option<Duration>,
    ) -> AudioResult<Box<dyn AudioHandle>>;

    /// Release backend resources. Loading afterwards fails with [`AudioError::ShutDown`].
    fn shutdown(&self);
}

/// Headless audio engine used for tests, daemons without output and CI.
///
/// Playback is simulated with a wall clock: the position advances while a
/// handle is playing and the handle completes once it reaches the duration.
#[derive(Debug, Default)]
pub struct NullAudioEngine {
    device: Option<String>,
    shut_down: AtomicBool,
}

impl NullAudioEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }
}

impl AudioEngine for NullAudioEngine {
    fn name(&self) -> &str {
        "null"
    }

    fn load(
        &self,
        source: AudioSource,
        duration: Option<Duration>,
    ) -> AudioResult<Box<dyn AudioHandle>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(AudioError::ShutDown);
        }
        if let AudioSource::Url(url) = &source {
            if url.trim().is_empty() {
                return Err(AudioError::UnsupportedSource("empty url".into()));
            }
        }
        tracing::debug!(
            source = %source.describe(),
            device = self.device.as_deref().unwrap_or("default"),
            "loading media on null engine"
        );
        Ok(Box::new(SimulatedHandle::new(duration)))
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("null audio engine shut down");
        }
    }
}

struct SimulatedHandle {
    state: AudioState,
    /// Position accumulated before the current playing stretch.
    offset: Duration,
    playing_since: Option<Instant>,
    duration: Option<Duration>,
    volume: f32,
}

impl fmt::Debug for SimulatedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedHandle")
            .field("state", &self.state())
            .field("position", &self.position())
            .field("volume", &self.volume)
            .finish()
    }
}

impl SimulatedHandle {
    fn new(duration: Option<Duration>) -> Self {
        Self {
            state: AudioState::Paused,
            offset: Duration::ZERO,
            playing_since: None,
            duration,
            volume: 1.0,
        }
    }

    fn raw_position(&self) -> Duration {
        let running = self
            .playing_since
            .map(|since| since.elapsed())
            .unwrap_or_default();
        self.offset + running
    }

    fn reached_end(&self) -> bool {
        matches!(self.duration, Some(duration) if self.raw_position() >= duration)
    }

    fn freeze(&mut self) {
        self.offset = self.position();
        self.playing_since = None;
    }
}

impl AudioHandle for SimulatedHandle {
    fn state(&self) -> AudioState {
        if self.state == AudioState::Playing && self.reached_end() {
            AudioState::Completed
        } else {
            self.state
        }
    }

    fn play(&mut self) {
        match self.state() {
            AudioState::Paused => {
                self.playing_since = Some(Instant::now());
                self.state = AudioState::Playing;
            }
            AudioState::Playing | AudioState::Completed | AudioState::Stopped => {}
        }
    }

    fn pause(&mut self) {
        if self.state() == AudioState::Playing {
            self.freeze();
            self.state = AudioState::Paused;
        }
    }

    fn seek(&mut self, position: Duration) -> AudioResult<()> {
        if let Some(duration) = self.duration {
            if position > duration {
                return Err(AudioError::SeekOutOfRange {
                    requested: position,
                    duration,
                });
            }
        }
        self.offset = position;
        if self.playing_since.is_some() {
            self.playing_since = Some(Instant::now());
        }
        Ok(())
    }

    fn position(&self) -> Duration {
        let position = self.raw_position();
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn stop(&mut self) {
        if self.state != AudioState::Stopped {
            self.freeze();
            self.state = AudioState::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn load(duration: Option<Duration>) -> Box<dyn AudioHandle> {
        NullAudioEngine::new()
            .load(AudioSource::Url("test://song".into()), duration)
            .expect("null engine should load")
    }

    #[test]
    fn loads_paused_at_zero() {
        let handle = load(Some(Duration::from_secs(3)));
        assert_eq!(handle.state(), AudioState::Paused);
        assert_eq!(handle.position(), Duration::ZERO);
    }

    #[test]
    fn position_advances_only_while_playing() {
        let mut handle = load(None);
        handle.play();
        thread::sleep(Duration::from_millis(60));
        handle.pause();
        let paused_at = handle.position();
        assert!(paused_at >= Duration::from_millis(50));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.position(), paused_at);
    }

    #[test]
    fn completes_at_duration() {
        let mut handle = load(Some(Duration::from_millis(40)));
        handle.play();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(handle.state(), AudioState::Completed);
        assert_eq!(handle.position(), Duration::from_millis(40));
    }

    #[test]
    fn seek_is_bounded_by_duration() {
        let mut handle = load(Some(Duration::from_secs(10)));
        handle.seek(Duration::from_secs(4)).unwrap();
        assert_eq!(handle.position(), Duration::from_secs(4));
        assert!(matches!(
            handle.seek(Duration::from_secs(11)),
            Err(AudioError::SeekOutOfRange { .. })
        ));
    }

    #[test]
    fn stopped_handle_ignores_play() {
        let mut handle = load(None);
        handle.stop();
        handle.play();
        assert_eq!(handle.state(), AudioState::Stopped);
    }

    #[test]
    fn shut_down_engine_refuses_to_load() {
        let engine = NullAudioEngine::with_device("hw:0");
        assert_eq!(engine.device(), Some("hw:0"));
        engine.shutdown();
        assert!(matches!(
            engine.load(AudioSource::File("/tmp/a.flac".into()), None),
            Err(AudioError::ShutDown)
        ));
    }

    #[test]
    fn empty_url_is_unsupported() {
        let engine = NullAudioEngine::new();
        assert!(matches!(
            engine.load(AudioSource::Url(" ".into()), None),
            Err(AudioError::UnsupportedSource(_))
        ));
    }
}
