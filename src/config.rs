//! Configuration module for the hive-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::{Address, HiveConfig};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "hive-echo")]
#[command(author = "hive-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A reactor-driven TCP echo server; press any key to stop", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Re-offer a fresh connection after every accept instead of serving one client
    #[arg(long)]
    pub continuous: bool,

    /// Interval between timer callbacks in milliseconds (0 disables them)
    #[arg(long)]
    pub timer_interval_ms: Option<u64>,

    /// Longest a single poll waits for events, in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Maximum bytes delivered by one receive
    #[arg(long)]
    pub buffer_size: Option<usize>,

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
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Keep accepting after the first client
    #[serde(default)]
    pub continuous: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            continuous: false,
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_timer_interval_ms")]
    pub timer_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timer_interval_ms: default_timer_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            buffer_size: default_buffer_size(),
            events_capacity: default_events_capacity(),
            max_connections: default_max_connections(),
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4444
}

fn default_timer_interval_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_buffer_size() -> usize {
    4096
}

fn default_events_capacity() -> usize {
    1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub continuous: bool,
    pub timer_interval: Duration,
    pub poll_interval: Duration,
    pub buffer_size: usize,
    pub events_capacity: usize,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let runtime = toml_config.runtime;
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            continuous: cli.continuous || toml_config.server.continuous,
            timer_interval: Duration::from_millis(
                cli.timer_interval_ms.unwrap_or(runtime.timer_interval_ms),
            ),
            poll_interval: Duration::from_millis(
                cli.poll_interval_ms.unwrap_or(runtime.poll_interval_ms),
            ),
            buffer_size: cli.buffer_size.unwrap_or(runtime.buffer_size).max(1),
            events_capacity: runtime.events_capacity.max(1),
            max_connections: runtime.max_connections,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }

    pub fn hive(&self) -> HiveConfig {
        HiveConfig {
            buffer_size: self.buffer_size,
            events_capacity: self.events_capacity,
            max_connections: self.max_connections,
            timer_interval: self.timer_interval,
            ..HiveConfig::default()
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
