use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// A listener could not bind. Fatal for daemon mode.
    #[error("failed to bind {service} on {addr}: {source}")]
    Bind {
        service: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("daemon i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single command. The message is sent back to the client.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("{command}: {reason}")]
    BadArgument {
        command: &'static str,
        reason: String,
    },
    #[error("{0}")]
    Failed(String),
}
