use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors surfaced by [`crate::client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client mode '{0}', expected KEEPALIVE or TIMEOUT")]
    InvalidMode(String),

    #[error("timeout must be a positive number of seconds")]
    InvalidTimeout,

    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to the server is closed")]
    Disconnected,

    #[error("failed to send message")]
    Send(#[source] io::Error),

    #[error("failed to read operator input")]
    Input(#[source] io::Error),
}

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}'", .0.display())]
    FileRead(PathBuf, #[source] io::Error),

    #[error("failed to parse config file '{}'", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
