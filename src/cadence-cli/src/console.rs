use cadence_app::{Presentation, PresentationContext};
use cadence_core::StatusReporter;
use cadence_player::{Player, PlayerState};
use std::io::{self, Write};

/// Text presentation for `--gui`: prints status messages, the current song
/// and live lyric lines to stdout.
#[derive(Debug, Default)]
pub struct ConsolePresentation;

fn print_line(line: &str) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{line}");
}

impl StatusReporter for ConsolePresentation {
    fn show_msg(&self, msg: &str) {
        print_line(msg);
    }
}

impl Presentation for ConsolePresentation {
    fn name(&self) -> &str {
        "console"
    }

    fn initialize(&self, ctx: PresentationContext<'_>) {
        ctx.live_lyric.sentence_changed.connect(|sentence: &String| {
            if !sentence.is_empty() {
                print_line(&format!("  {sentence}"));
            }
            Ok(())
        });

        ctx.player
            .state_changed
            .connect_weak(ctx.player, |player: &Player, state: &PlayerState| {
                match (state, player.current_song()) {
                    (PlayerState::Playing, Some(song)) => {
                        print_line(&format!("> {}", song.describe()))
                    }
                    (PlayerState::Paused, Some(song)) => {
                        print_line(&format!("|| {}", song.describe()))
                    }
                    _ => {}
                }
                Ok(())
            });
    }
}
