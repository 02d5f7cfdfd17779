use crate::mode::AppMode;
use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

pub const DEFAULT_COMMAND_PORT: u16 = 23333;
pub const DEFAULT_PUBSUB_PORT: u16 = 23334;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default = "default_mode")]
    pub mode: AppMode,
    /// Listen on all interfaces instead of loopback only.
    #[serde(default)]
    pub allow_lan_connect: bool,
    /// JSON endpoint announcing the latest release; no check when unset.
    #[serde(default)]
    pub release_check_url: Option<String>,
    #[serde(default)]
    pub audio_device: Option<String>,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            mode: default_mode(),
            allow_lan_connect: false,
            release_check_url: None,
            audio_device: None,
            daemon: DaemonConfig::default(),
            library: LibraryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "default_pubsub_port")]
    pub pubsub_port: u16,
    /// Idle read/write deadline for daemon client connections.
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command_port: default_command_port(),
            pubsub_port: default_pubsub_port(),
            io_timeout_secs: default_io_timeout_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directories scanned by the local provider.
    #[serde(default)]
    pub music_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: true,
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("command server and pub/sub gateway cannot share port {port}")]
    PortConflict { port: u16 },
    #[error("daemon.io_timeout_secs must be greater than zero")]
    ZeroTimeout,
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        // Port 0 asks the OS for an ephemeral port, so two zeros never clash.
        if self.daemon.command_port != 0 && self.daemon.command_port == self.daemon.pubsub_port {
            return Err(ValidationError::PortConflict {
                port: self.daemon.command_port,
            });
        }
        if self.daemon.io_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        Ok(())
    }

    /// Mode flags after applying `daemon.enabled`.
    pub fn effective_mode(&self) -> AppMode {
        if self.daemon.enabled {
            self.mode
        } else {
            self.mode.without(AppMode::DAEMON)
        }
    }

    /// Address the daemon listeners bind to.
    pub fn listen_addr(&self) -> IpAddr {
        if self.allow_lan_connect {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_mode() -> AppMode {
    AppMode::DAEMON
}

fn default_true() -> bool {
    true
}

fn default_command_port() -> u16 {
    DEFAULT_COMMAND_PORT
}

fn default_pubsub_port() -> u16 {
    DEFAULT_PUBSUB_PORT
}

fn default_io_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, AppMode::DAEMON);
        assert_eq!(config.daemon.command_port, 23333);
        assert_eq!(config.daemon.pubsub_port, 23334);
        assert_eq!(config.logging.max_log_files, 7);
        assert_eq!(config.listen_addr(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn invalid_version_rejected() {
        let mut config = Config::default();
        config.config_version = CURRENT_CONFIG_VERSION + 1;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn shared_port_rejected_unless_ephemeral() {
        let mut config = Config::default();
        config.daemon.pubsub_port = config.daemon.command_port;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::PortConflict { port: 23333 })
        ));

        config.daemon.command_port = 0;
        config.daemon.pubsub_port = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_toml_with_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
mode = ["daemon", "gui"]
allow_lan_connect = true

[daemon]
enabled = false
pubsub_port = 24000

[library]
music_dirs = ["/srv/music"]
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.mode, AppMode::DAEMON | AppMode::GUI);
        assert_eq!(config.effective_mode(), AppMode::GUI);
        assert_eq!(config.daemon.pubsub_port, 24000);
        assert_eq!(config.daemon.command_port, DEFAULT_COMMAND_PORT);
        assert_eq!(config.listen_addr(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.library.music_dirs, vec![PathBuf::from("/srv/music")]);
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "mode = [\"tray\"]\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
