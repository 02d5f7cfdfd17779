mod console;

use anyhow::{Context, Result};
use cadence_app::{App, AttachOptions, Presentation};
use cadence_core::{init_logging, AppDirs, AppMode, Config, LogLevel};
use cadence_daemon::{CommandHandler, PlayerCommands, Request};
use clap::{Parser, Subcommand};
use console::ConsolePresentation;
use local_provider::LocalLibraryPlugin;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "cadence", version, about = "Music player host with a TCP control daemon")]
struct Cli {
    /// Run the command server and pub/sub gateway
    #[arg(long, global = true, conflicts_with = "no_daemon")]
    daemon: bool,
    /// Disable the daemon even if the config enables it
    #[arg(long, global = true)]
    no_daemon: bool,
    /// Bring up the console presentation
    #[arg(long, global = true)]
    gui: bool,
    /// Listen on all interfaces instead of loopback
    #[arg(long, global = true)]
    allow_lan: bool,
    /// Session state file (defaults to state.json in the data directory)
    #[arg(long, global = true, value_name = "PATH")]
    state_file: Option<PathBuf>,
    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one player command against the saved session, then save it again
    Exec {
        /// Command and argument, e.g. `add cadence://local/songs//music/a.mp3`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// List the providers contributed by plugins
    Providers,
    /// Print the effective configuration
    Config,
}

impl Cli {
    /// Fold command-line flags into the loaded configuration. Subcommands are
    /// one-shot and always run in CLI mode.
    fn apply_overrides(&self, config: &mut Config) {
        if self.command.is_some() {
            config.mode = AppMode::CLI;
        } else {
            if self.daemon {
                config.mode |= AppMode::DAEMON;
                config.daemon.enabled = true;
            }
            if self.no_daemon {
                config.daemon.enabled = false;
            }
            if self.gui {
                config.mode |= AppMode::GUI;
            }
        }
        if self.allow_lan {
            config.allow_lan_connect = true;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let mut config = Config::load_or_default(&dirs)?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    let _logging = init_logging(&config.logging, &dirs)?;

    if let Some(Command::Config) = cli.command {
        println!("# {}", Config::config_path(&dirs).display());
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    tracing::info!(
        mode = %config.effective_mode(),
        config_dir = %dirs.config_dir().display(),
        "starting cadence"
    );
    let options = AttachOptions {
        plugins: vec![Box::new(LocalLibraryPlugin)],
        presentation: Some(Box::new(|_config: &Config| {
            Box::new(ConsolePresentation) as Box<dyn Presentation>
        })),
        state_file: cli.state_file.clone(),
        ..AttachOptions::default()
    };
    let app = App::new(config, options);
    app.attach()?;
    app.initialize()?;

    match cli.command {
        Some(Command::Exec { command }) => {
            let line = command.join(" ");
            let reply = app.run_once(exec(app.clone(), line)).await??;
            if !reply.is_empty() {
                println!("{reply}");
            }
        }
        Some(Command::Providers) => {
            let ids = app
                .run_once(async { app.subsystems().map(|s| s.registry.ids()) })
                .await?
                .unwrap_or_default();
            if ids.is_empty() {
                println!("No providers registered.");
            }
            for id in ids {
                println!("{id}");
            }
        }
        Some(Command::Config) | None => app.run().await?,
    }
    Ok(())
}

async fn exec(app: Arc<App>, line: String) -> Result<String> {
    let subsystems = app.subsystems().context("app is not attached")?;
    let handler = PlayerCommands::new(subsystems.player.clone(), subsystems.resolver());
    let request = Request::parse(&line).context("no command given")?;
    let reply = handler.handle(&request)?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("cadence").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_extend_the_configured_mode() {
        let mut config = Config::default();
        config.mode = AppMode::DAEMON;
        parse(&["--gui", "--allow-lan", "--log-level", "debug"]).apply_overrides(&mut config);
        assert_eq!(config.mode, AppMode::DAEMON | AppMode::GUI);
        assert!(config.allow_lan_connect);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn no_daemon_wins_over_config() {
        let mut config = Config::default();
        config.mode = AppMode::DAEMON;
        parse(&["--no-daemon"]).apply_overrides(&mut config);
        assert!(!config.effective_mode().contains(AppMode::DAEMON));
    }

    #[test]
    fn daemon_and_no_daemon_conflict() {
        let parsed = Cli::try_parse_from(["cadence", "--daemon", "--no-daemon"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn subcommands_run_in_cli_mode() {
        let mut config = Config::default();
        config.mode = AppMode::DAEMON | AppMode::GUI;
        let cli = parse(&["--gui", "exec", "volume", "0.5"]);
        cli.apply_overrides(&mut config);
        assert_eq!(config.mode, AppMode::CLI);
        match cli.command {
            Some(Command::Exec { command }) => assert_eq!(command, vec!["volume", "0.5"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn state_file_is_optional() {
        let cli = parse(&["--state-file", "/tmp/s.json"]);
        assert_eq!(cli.state_file, Some(PathBuf::from("/tmp/s.json")));
        assert!(parse(&[]).state_file.is_none());
    }
}
