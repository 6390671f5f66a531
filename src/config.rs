use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable naming an optional TOML config file.
pub const CONFIG_ENV: &str = "RAS_CONFIG";

pub const DEFAULT_PORT: u16 = 53000;
pub const DEFAULT_MAX_USERS: u32 = 30;
pub const DEFAULT_MAX_COMMAND_SIZE: usize = 65536;
pub const DEFAULT_PATH: &str = "bin:.";
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1 << 20;
pub const DEFAULT_OUTPUT_LIMIT: usize = 16 << 20;

/// Server configuration, loaded from TOML. Every field has a default so an
/// empty file (or no file at all) yields a usable config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listening socket to.
    pub bind: IpAddr,
    /// Listening port. The CLI positional argument overrides this.
    pub port: u16,
    /// Upper bound of the id pool; ids run from 1 to `max_users` inclusive.
    pub max_users: u32,
    /// Maximum number of bytes buffered for one unterminated command line.
    pub max_command_size: usize,
    /// Initial `PATH` of every new session.
    pub default_path: String,
    /// Working directory for spawned stages and relative redirection files.
    /// `None` means the server's own working directory.
    pub workdir: Option<PathBuf>,
    /// Byte bound for one pending user-to-user mailbox.
    pub mailbox_capacity: usize,
    /// Byte bound for the output of one command line, and for each
    /// numbered-pipe slot. A stage writing past it is cut off.
    pub output_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_users: DEFAULT_MAX_USERS,
            max_command_size: DEFAULT_MAX_COMMAND_SIZE,
            default_path: DEFAULT_PATH.to_string(),
            workdir: None,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Resolve the effective config: the file named by `$RAS_CONFIG` when set
    /// and present, defaults otherwise.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                let path = PathBuf::from(path);
                match Self::load(&path)? {
                    Some(config) => Ok(config),
                    None => {
                        tracing::warn!(path = %path.display(), "config file not found, using defaults");
                        Ok(Self::default())
                    }
                }
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_users == 0 {
            return Err(ConfigError::Invalid("max_users must be at least 1".into()));
        }
        if self.max_command_size == 0 {
            return Err(ConfigError::Invalid("max_command_size must be at least 1".into()));
        }
        if self.output_limit == 0 {
            return Err(ConfigError::Invalid("output_limit must be at least 1".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Resolve a redirection path against the configured working directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.workdir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
