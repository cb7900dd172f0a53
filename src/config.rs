//! Configuration module for the babble server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the babble server
#[derive(Parser, Debug)]
#[command(name = "babble-server")]
#[command(author = "babble-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client babble server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of executor threads draining the command queue
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of executor threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of live connection handlers
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Capacity of the command handoff queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            max_connections: default_max_connections(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Client directory configuration
#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of simultaneously registered clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5656
}

fn default_workers() -> usize {
    4
}

fn default_max_connections() -> usize {
    100
}

fn default_queue_capacity() -> usize {
    10
}

fn default_max_clients() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub workers: usize,
    pub max_connections: usize,
    pub queue_capacity: usize,
    pub max_clients: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let host: IpAddr = toml_config
            .server
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(toml_config.server.host.clone()))?;

        let config = Config {
            host,
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            queue_capacity: toml_config.server.queue_capacity,
            max_clients: toml_config.registry.max_clients,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Every pool and bound must admit at least one participant,
    /// otherwise the pipeline can never make progress.
    fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [
            ("workers", self.workers),
            ("max_connections", self.max_connections),
            ("queue_capacity", self.queue_capacity),
            ("max_clients", self.max_clients),
        ];
        for (name, value) in bounds {
            if value == 0 {
                return Err(ConfigError::Invalid(name));
            }
        }
        Ok(())
    }

    /// Address handed to the listener.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0} must be greater than zero")]
    Invalid(&'static str),
    #[error("Invalid configuration: host '{0}' is not an IP address")]
    InvalidHost(String),
}
