//! Daemon-mode IPC: the command server and the pub/sub gateway.

mod commands;
mod error;
mod gateway;
mod line;
mod publisher;
mod server;

pub use commands::PlayerCommands;
pub use error::{CommandError, DaemonError};
pub use gateway::{ClientId, Gateway, GatewayServer, PUBSUB_VERSION, QUEUE_CAPACITY};
pub use publisher::{
    live_lyric_publisher, now_playing_publisher, Publisher, LIVE_LYRIC_TOPIC, NOW_PLAYING_TOPIC,
};
pub use server::{CommandHandler, CommandServer, Request, COMMAND_PROTOCOL_VERSION};
