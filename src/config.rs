//! Configuration module for the shoal server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the socket server
#[derive(Parser, Debug)]
#[command(name = "shoal")]
#[command(author = "shoal authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded, event-driven TCP socket server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrent connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub buffers: BufferSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Accepts performed per readiness event before yielding to I/O
    #[serde(default = "default_accept_batch")]
    pub accept_batch: usize,
    /// Capacity of the readiness event batch
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Set TCP_NODELAY on accepted sockets
    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            accept_batch: default_accept_batch(),
            event_capacity: default_event_capacity(),
            tcp_nodelay: default_tcp_nodelay(),
        }
    }
}

/// Buffer-related configuration
#[derive(Debug, Deserialize)]
pub struct BufferSection {
    /// Bytes read per syscall while draining a readable socket
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Write-buffer occupancy at which enqueues start failing with WouldBlock
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    /// Write-buffer occupancy at which enqueues are accepted again
    #[serde(default = "default_low_water")]
    pub low_water: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            read_chunk: default_read_chunk(),
            high_water: default_high_water(),
            low_water: default_low_water(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
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
    7171
}

fn default_max_connections() -> usize {
    10240
}

fn default_accept_batch() -> usize {
    128
}

fn default_event_capacity() -> usize {
    1024
}

fn default_tcp_nodelay() -> bool {
    true
}

fn default_read_chunk() -> usize {
    16 * 1024
}

fn default_high_water() -> usize {
    256 * 1024
}

fn default_low_water() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub accept_batch: usize,
    pub event_capacity: usize,
    pub tcp_nodelay: bool,
    pub read_chunk: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            accept_batch: default_accept_batch(),
            event_capacity: default_event_capacity(),
            tcp_nodelay: default_tcp_nodelay(),
            read_chunk: default_read_chunk(),
            high_water: default_high_water(),
            low_water: default_low_water(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            accept_batch: toml_config.server.accept_batch,
            event_capacity: toml_config.server.event_capacity,
            tcp_nodelay: toml_config.server.tcp_nodelay,
            read_chunk: toml_config.buffers.read_chunk,
            high_water: toml_config.buffers.high_water,
            low_water: toml_config.buffers.low_water,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.low_water >= self.high_water {
            return Err(ConfigError::Invalid(format!(
                "low_water ({}) must be below high_water ({})",
                self.low_water, self.high_water
            )));
        }
        if self.accept_batch == 0 {
            return Err(ConfigError::Invalid(
                "accept_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
