//! Settings for the server and client.
//!
//! Values come from three layers: built-in defaults, an optional TOML file
//! passed with `--config`, and command-line flags. Flags win over the file,
//! the file wins over defaults.

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Deserialize;

use crate::{
    cli::{ClientArgs, ServerArgs},
    error::ConfigError,
    server::ReadErrorPolicy,
};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_CLIENT_MODE: &str = "KEEPALIVE";
pub const DEFAULT_SERVER_MODE: &str = "DEBUG";
pub const DEFAULT_MAX_READ_RETRIES: u32 = 5;

/// Server verbosity. Anything other than `DEBUG` selects [`ServerMode::Standard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Debug,
    Standard,
}

impl ServerMode {
    pub fn parse(mode: &str) -> Self {
        if mode == "DEBUG" {
            ServerMode::Debug
        } else {
            ServerMode::Standard
        }
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(self) -> &'static str {
        match self {
            ServerMode::Debug => "debug",
            ServerMode::Standard => "warn",
        }
    }
}

/// What the server does when reading from a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReadErrorAction {
    Retry,
    Close,
}

#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub mode: Option<String>,
    pub on_read_error: Option<ReadErrorAction>,
    pub max_read_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub mode: Option<String>,
    pub timeout: Option<u64>,
}

impl FileConfig {
    /// Reads the TOML file at `path`, or returns an empty config when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::TomlParse(PathBuf::from(origin), e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub mode: ServerMode,
    pub read_error_policy: ReadErrorPolicy,
}

impl ServerSettings {
    pub fn load(args: &ServerArgs) -> Result<Self, ConfigError> {
        let file = FileConfig::load(args.config.as_deref())?;
        Ok(Self::resolve(args, file.server))
    }

    pub fn resolve(args: &ServerArgs, file: ServerSection) -> Self {
        let mode = args
            .mode
            .as_deref()
            .or(file.mode.as_deref())
            .unwrap_or(DEFAULT_SERVER_MODE);
        let max_consecutive = args
            .max_read_retries
            .or(file.max_read_retries)
            .unwrap_or(DEFAULT_MAX_READ_RETRIES);
        let read_error_policy = match args
            .on_read_error
            .or(file.on_read_error)
            .unwrap_or(ReadErrorAction::Retry)
        {
            ReadErrorAction::Retry => ReadErrorPolicy::Retry { max_consecutive },
            ReadErrorAction::Close => ReadErrorPolicy::Close,
        };

        Self {
            host: args
                .host
                .clone()
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: args.port.or(file.port).unwrap_or(DEFAULT_PORT),
            mode: ServerMode::parse(mode),
            read_error_policy,
        }
    }
}

/// Client settings as configured. The mode string is validated when the
/// client is built, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub mode: String,
    pub timeout: Option<u64>,
}

impl ClientSettings {
    pub fn load(args: &ClientArgs) -> Result<Self, ConfigError> {
        let file = FileConfig::load(args.config.as_deref())?;
        Ok(Self::resolve(args, file.client))
    }

    pub fn resolve(args: &ClientArgs, file: ClientSection) -> Self {
        Self {
            host: args
                .host
                .clone()
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: args.port.or(file.port).unwrap_or(DEFAULT_PORT),
            mode: args
                .mode
                .clone()
                .or(file.mode)
                .unwrap_or_else(|| DEFAULT_CLIENT_MODE.to_string()),
            timeout: args.timeout.or(file.timeout),
        }
    }
}
