mod engine;

pub use engine::{
    AudioEngine, AudioError, AudioHandle, AudioResult, AudioSource, AudioState, NullAudioEngine,
};
