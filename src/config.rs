//! Configuration module for the nsrpc server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::rpc::peer::{CloseFlags, CloseFlagsConfig};
use crate::runtime::netstring::MAX_PAYLOAD_SIZE;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the RPC server
#[derive(Parser, Debug, Default)]
#[command(name = "nsrpc")]
#[command(version)]
#[command(about = "Netstring-framed JSON-RPC server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: CloseFlagsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_connections: usize,
    /// Largest accepted frame payload in bytes
    pub max_message_size: usize,
    /// Bound on establishing outbound connections
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7080,
            workers: 5,
            max_connections: 10240,
            max_message_size: MAX_PAYLOAD_SIZE,
            connect_timeout_ms: 5000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub connect_timeout: Duration,
    /// Close flags of accepted connections
    pub close_flags: CloseFlags,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => TomlConfig::from_file(path)?,
            None => TomlConfig::default(),
        };
        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// CLI values win over file values.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            workers: cli.workers.unwrap_or(server.workers),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            max_message_size: server.max_message_size,
            connect_timeout: Duration::from_millis(server.connect_timeout_ms),
            close_flags: CloseFlags::from(toml_config.connection),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "server.workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "server.max_connections",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::Invalid {
                key: "server.max_message_size",
                reason: format!("must be between 1 and {MAX_PAYLOAD_SIZE}"),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "server.connect_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        crate::logging::level_from_name(&self.log_level).map_err(|e| ConfigError::Invalid {
            key: "logging.level",
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

impl TomlConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
