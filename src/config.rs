//! Server configuration.
//!
//! The launcher consumes environment-tunable flags (`OBJM_*`); argument
//! parsing and daemonization live outside this crate. Validation failures
//! surface before any socket is bound so a misconfigured server exits
//! with status 1.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A value failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// An environment variable could not be parsed
    #[error("Cannot parse {var}={value}")]
    Parse {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Which listener the server runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unix domain stream socket
    Unix,
    /// TCP stream socket
    Tcp,
    /// UDP datagram socket
    Udp,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(TransportKind::Unix),
            "tcp" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            other => Err(ConfigError::Parse {
                var: "OBJM_TRANSPORT",
                value: other.to_string(),
            }),
        }
    }
}

/// Full server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener transport
    pub transport: TransportKind,

    /// Unix socket path (unix transport)
    pub socket_path: PathBuf,

    /// Bind host (tcp/udp transports)
    pub host: String,

    /// Bind port (tcp/udp transports)
    pub port: u16,

    /// Root of the default persistent backend
    pub backing_dir: PathBuf,

    /// Root of the memory cache backend, when one is wanted
    pub cache_dir: Option<PathBuf>,

    /// Root of the ephemeral-only backend, when one is wanted
    pub ephemeral_dir: Option<PathBuf>,

    /// Cache backend capacity in bytes
    pub cache_limit: u64,

    /// Concurrent stream connections accepted
    pub max_connections: usize,

    /// Cache maintenance tick interval
    pub maintenance_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Unix,
            socket_path: PathBuf::from("/tmp/objmapper.sock"),
            host: "127.0.0.1".to_string(),
            port: 9380,
            backing_dir: PathBuf::from("./objects"),
            cache_dir: None,
            ephemeral_dir: None,
            cache_limit: 1 << 30, // 1 GiB
            max_connections: 10,
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Build the configuration from `OBJM_*` environment variables.
    /// `OBJM_BACKING_DIR` is required; everything else has a default.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(value) = env_string("OBJM_TRANSPORT") {
            config.transport = value.parse()?;
        }
        if let Some(value) = env_string("OBJM_SOCKET_PATH") {
            config.socket_path = PathBuf::from(value);
        }
        if let Some(value) = env_string("OBJM_HOST") {
            config.host = value;
        }
        if let Some(value) = env_parse::<u16>("OBJM_PORT")? {
            config.port = value;
        }
        match env_string("OBJM_BACKING_DIR") {
            Some(value) => config.backing_dir = PathBuf::from(value),
            None => {
                return Err(ConfigError::Invalid(
                    "OBJM_BACKING_DIR is required".into(),
                ))
            }
        }
        config.cache_dir = env_string("OBJM_CACHE_DIR").map(PathBuf::from);
        config.ephemeral_dir = env_string("OBJM_EPHEMERAL_DIR").map(PathBuf::from);
        if let Some(value) = env_parse::<u64>("OBJM_CACHE_LIMIT")? {
            config.cache_limit = value;
        }
        if let Some(value) = env_parse::<usize>("OBJM_MAX_CONNECTIONS")? {
            config.max_connections = value;
        }
        if let Some(value) = env_parse::<u64>("OBJM_MAINT_INTERVAL_MS")? {
            config.maintenance_interval = Duration::from_millis(value);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for internal consistency
    pub fn validate(&self) -> ConfigResult<()> {
        if self.backing_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("backing_dir must not be empty".into()));
        }
        if self.transport == TransportKind::Unix && self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_path must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.cache_dir.is_some() && self.cache_limit == 0 {
            return Err(ConfigError::Invalid(
                "cache_limit must be non-zero when a cache_dir is set".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(var: &'static str) -> ConfigResult<Option<T>> {
    match env_string(var) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Parse { var, value }),
        None => Ok(None),
    }
}
