//! The built-in command set, driving the shared [`Player`].

use crate::error::CommandError;
use crate::server::{CommandHandler, Request};
use cadence_core::{reverse_line, PlaybackMode, ReferenceResolver, Song};
use cadence_player::{Player, PlayerError};
use std::fmt::Write as _;
use std::sync::Arc;

const HELP: &str = "\
status              show player state
play [ref]          play a song, or start playback
pause               pause playback
resume              resume playback
toggle              pause or resume
stop                stop playback
next                play the next song
previous            play the previous song
list                list the playlist as references
add <ref>           append a song to the playlist
remove <ref>        remove a song from the playlist
clear               empty the playlist
volume [0..1]       show or set the volume
mode [0..3]         show or set the playback mode
help                show this text
quit                close the connection";

pub struct PlayerCommands {
    player: Arc<Player>,
    resolver: Arc<dyn ReferenceResolver>,
}

impl PlayerCommands {
    pub fn new(player: Arc<Player>, resolver: Arc<dyn ReferenceResolver>) -> Self {
        Self { player, resolver }
    }

    fn resolve(&self, command: &'static str, arg: Option<&str>) -> Result<Song, CommandError> {
        let reference = arg.ok_or_else(|| CommandError::BadArgument {
            command,
            reason: "missing song reference".to_string(),
        })?;
        self.resolver
            .resolve(reference)
            .map_err(|err| CommandError::Failed(err.to_string()))
    }

    fn describe(&self, song: Option<&Song>) -> String {
        match song {
            Some(song) => reverse_line(self.resolver.as_ref(), song)
                .unwrap_or_else(|_| format!("# {}", song.describe())),
            None => String::new(),
        }
    }

    fn status(&self) -> String {
        let player = &self.player;
        let mode = player.playlist().playback_mode();
        let mut out = String::new();
        let _ = writeln!(out, "state: {}", player.state().label());
        let _ = writeln!(out, "song: {}", self.describe(player.current_song().as_ref()));
        let _ = writeln!(out, "position: {:.2}", player.position());
        match player.duration() {
            Some(duration) => {
                let _ = writeln!(out, "duration: {duration:.2}");
            }
            None => out.push_str("duration: \n"),
        }
        let _ = writeln!(out, "volume: {:.2}", player.volume());
        let _ = write!(out, "mode: {} ({})", u8::from(mode), mode.label());
        out
    }

    fn list(&self) -> String {
        self.player
            .playlist()
            .list()
            .iter()
            .map(|song| self.describe(Some(song)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn volume(&self, arg: Option<&str>) -> Result<String, CommandError> {
        if let Some(arg) = arg {
            let volume: f64 = arg
                .parse()
                .ok()
                .filter(|volume: &f64| (0.0..=1.0).contains(volume))
                .ok_or_else(|| CommandError::BadArgument {
                    command: "volume",
                    reason: format!("expected a number between 0 and 1, got '{arg}'"),
                })?;
            self.player.set_volume(volume);
        }
        Ok(format!("{:.2}", self.player.volume()))
    }

    fn mode(&self, arg: Option<&str>) -> Result<String, CommandError> {
        let playlist = self.player.playlist();
        if let Some(arg) = arg {
            let mode = arg
                .parse::<u8>()
                .ok()
                .and_then(|value| PlaybackMode::try_from(value).ok())
                .ok_or_else(|| CommandError::BadArgument {
                    command: "mode",
                    reason: format!("expected 0, 1, 2 or 3, got '{arg}'"),
                })?;
            playlist.set_playback_mode(mode);
        }
        let mode = playlist.playback_mode();
        Ok(format!("{} ({})", u8::from(mode), mode.label()))
    }

    fn step(&self, moved: Result<bool, PlayerError>, which: &str) -> Result<String, CommandError> {
        match moved.map_err(failed)? {
            true => Ok(self.describe(self.player.current_song().as_ref())),
            false => Err(CommandError::Failed(format!("no {which} song"))),
        }
    }
}

fn failed(err: PlayerError) -> CommandError {
    CommandError::Failed(err.to_string())
}

impl CommandHandler for PlayerCommands {
    fn handle(&self, request: &Request<'_>) -> Result<String, CommandError> {
        let player = &self.player;
        match request.name {
            "status" => Ok(self.status()),
            "play" => match request.arg {
                Some(_) => {
                    let song = self.resolve("play", request.arg)?;
                    player.play_song(song.clone()).map_err(failed)?;
                    Ok(self.describe(Some(&song)))
                }
                None => {
                    if player.state() != cadence_player::PlayerState::Playing {
                        player.toggle().map_err(failed)?;
                    }
                    Ok(player.state().label().to_string())
                }
            },
            "pause" => {
                player.pause();
                Ok(player.state().label().to_string())
            }
            "resume" => {
                player.resume();
                Ok(player.state().label().to_string())
            }
            "toggle" => player
                .toggle()
                .map(|state| state.label().to_string())
                .map_err(failed),
            "stop" => {
                player.stop();
                Ok(player.state().label().to_string())
            }
            "next" => self.step(player.play_next(), "next"),
            "previous" => self.step(player.play_previous(), "previous"),
            "list" => Ok(self.list()),
            "add" => {
                let song = self.resolve("add", request.arg)?;
                if player.playlist().add(song) {
                    Ok("added".to_string())
                } else {
                    Ok("already in playlist".to_string())
                }
            }
            "remove" => {
                let song = self.resolve("remove", request.arg)?;
                if player.playlist().remove(&song) {
                    Ok("removed".to_string())
                } else {
                    Err(CommandError::Failed("song is not in the playlist".to_string()))
                }
            }
            "clear" => {
                player.playlist().clear();
                Ok("cleared".to_string())
            }
            "volume" => self.volume(request.arg),
            "mode" => self.mode(request.arg),
            "help" => Ok(HELP.to_string()),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}
