mod lyric;
mod player;
mod playlist;
mod session;

pub use lyric::{LiveLyric, Lyric, LyricSource, RegistryLyrics};
pub use player::{MediaChange, Player, PlayerError, PlayerState};
pub use playlist::Playlist;
pub use session::{ApplyReport, SessionError, SessionResult, SessionState, SessionStore};
