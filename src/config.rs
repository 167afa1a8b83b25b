//! Configuration module for the pipeline server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::connection::{
    ConnOptions, DEFAULT_DISPATCH_QUEUE, DEFAULT_MAX_STALLED, DEFAULT_RECV_QUEUE,
    DEFAULT_SEND_QUEUE, DEFAULT_TIMEOUT,
};
use crate::handle::Handle;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "conn-pipeline")]
#[command(author = "conn-pipeline authors")]
#[command(version = "0.1.0")]
#[command(about = "Echo server built on the per-connection pipeline", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7070)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Depth of the receive queue
    #[arg(long)]
    pub recv_queue: Option<usize>,

    /// Depth of the dispatch queue
    #[arg(long)]
    pub dispatch_queue: Option<usize>,

    /// Depth of the send queue
    #[arg(long)]
    pub send_queue: Option<usize>,

    /// Receive (decode) timeout in milliseconds
    #[arg(long)]
    pub recv_timeout_ms: Option<u64>,

    /// Send (serialize + write) timeout in milliseconds
    #[arg(long)]
    pub send_timeout_ms: Option<u64>,

    /// Dispatch (message handler) timeout in milliseconds
    #[arg(long)]
    pub dispatch_timeout_ms: Option<u64>,

    /// Log framework-internal pipeline events
    #[arg(long)]
    pub debug: bool,

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
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection pipeline settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    #[serde(default = "default_recv_queue")]
    pub recv_queue: usize,
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    #[serde(default = "default_timeout_ms")]
    pub recv_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Cap on raced callbacks still running after their deadline
    #[serde(default = "default_max_stalled")]
    pub max_stalled: usize,
    #[serde(default)]
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recv_queue: default_recv_queue(),
            dispatch_queue: default_dispatch_queue(),
            send_queue: default_send_queue(),
            recv_timeout_ms: default_timeout_ms(),
            send_timeout_ms: default_timeout_ms(),
            dispatch_timeout_ms: default_timeout_ms(),
            max_stalled: default_max_stalled(),
            debug: false,
        }
    }
}

impl PipelineConfig {
    /// Build connection options around a shared handle.
    pub fn options<H: Handle>(&self, handle: Arc<H>) -> ConnOptions<H> {
        ConnOptions::with_shared_handle(handle)
            .with_queue_depths(self.recv_queue, self.dispatch_queue, self.send_queue)
            .with_timeouts(
                Duration::from_millis(self.recv_timeout_ms),
                Duration::from_millis(self.send_timeout_ms),
                Duration::from_millis(self.dispatch_timeout_ms),
            )
            .with_max_stalled(self.max_stalled)
            .with_debug(self.debug)
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

fn default_listen() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_recv_queue() -> usize {
    DEFAULT_RECV_QUEUE
}

fn default_dispatch_queue() -> usize {
    DEFAULT_DISPATCH_QUEUE
}

fn default_send_queue() -> usize {
    DEFAULT_SEND_QUEUE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_max_stalled() -> usize {
    DEFAULT_MAX_STALLED
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub pipeline: PipelineConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        let pipeline = PipelineConfig {
            recv_queue: cli.recv_queue.unwrap_or(file.pipeline.recv_queue),
            dispatch_queue: cli.dispatch_queue.unwrap_or(file.pipeline.dispatch_queue),
            send_queue: cli.send_queue.unwrap_or(file.pipeline.send_queue),
            recv_timeout_ms: cli.recv_timeout_ms.unwrap_or(file.pipeline.recv_timeout_ms),
            send_timeout_ms: cli.send_timeout_ms.unwrap_or(file.pipeline.send_timeout_ms),
            dispatch_timeout_ms: cli
                .dispatch_timeout_ms
                .unwrap_or(file.pipeline.dispatch_timeout_ms),
            max_stalled: file.pipeline.max_stalled,
            debug: cli.debug || file.pipeline.debug,
        };

        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            pipeline,
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
