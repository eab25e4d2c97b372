//! Setup failures: anything that stops a node before it starts running.

use sensor_bus::{ChannelError, ConfigError, PeerIdError, TransportError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Invalid node name: {0}")]
    NodeName(#[from] PeerIdError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot open log file {}: {source}", path.display())]
    Logging {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot install logger: {0}")]
    LoggerInit(String),

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Channel setup failed: {0}")]
    Channel(#[from] ChannelError),
}
