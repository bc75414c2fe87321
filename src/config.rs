//! Configuration module for frame-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::apps::AppType;
use crate::endpoint::Endpoint;
use crate::protocol::MAX_FRAME_PAYLOAD;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Port used by default for both server and client
pub const DEFAULT_PORT: u16 = 9857;

/// Payload sent by `send` when none is given
pub const DEFAULT_MESSAGE: &str = "Hello from client!";

/// Command-line interface
#[derive(Parser, Debug)]
#[command(name = "frame-echo")]
#[command(author = "frame-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed request/response TCP server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server
    Serve(ServeArgs),
    /// Send one request to a server and print the response
    Send(SendArgs),
}

/// Server arguments
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog (pending, not yet accepted connections)
    #[arg(short, long)]
    pub backlog: Option<u32>,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum request/response payload size in bytes
    #[arg(short = 'm', long)]
    pub max_message_bytes: Option<usize>,

    /// Application to serve
    #[arg(short, long, value_enum)]
    pub app: Option<AppType>,

    /// Time allowed for connections to drain on shutdown, in milliseconds
    #[arg(short, long)]
    pub drain_deadline_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Client arguments
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of times to send the message over the same connection
    #[arg(short = 'n', long, default_value_t = 1)]
    pub repeat: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Payload to send
    #[arg(default_value = DEFAULT_MESSAGE)]
    pub message: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent connections (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            workers: None,
        }
    }
}

/// Framing and application configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum payload size in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Application to serve
    #[serde(default)]
    pub app: AppType,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            app: AppType::default(),
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    /// Drain deadline in milliseconds
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_deadline_ms: default_drain_deadline_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Interval for logging connection statistics in seconds (0 = disabled)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stats_interval: default_stats_interval(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_backlog() -> u32 {
    10
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_drain_deadline_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    60
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub max_message_bytes: usize,
    pub app: AppType,
    pub drain_deadline_ms: u64,
    pub log_level: String,
    pub stats_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(ServeArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load(args: ServeArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = args.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config::merge(args, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(args: ServeArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: args.host.unwrap_or(toml_config.server.host),
            port: args.port.unwrap_or(toml_config.server.port),
            backlog: args.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: args
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            workers: args.workers.or(toml_config.server.workers),
            max_message_bytes: args
                .max_message_bytes
                .unwrap_or(toml_config.protocol.max_message_bytes),
            app: args.app.unwrap_or(toml_config.protocol.app),
            drain_deadline_ms: args
                .drain_deadline_ms
                .unwrap_or(toml_config.shutdown.drain_deadline_ms),
            log_level: args.log_level.unwrap_or(toml_config.logging.level),
            stats_interval: toml_config.logging.stats_interval,
        }
    }

    /// Check value ranges that the types alone do not enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be at least 1".to_string()));
        }
        if self.max_message_bytes == 0 || self.max_message_bytes > MAX_FRAME_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "max_message_bytes must be between 1 and {}",
                MAX_FRAME_PAYLOAD
            )));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.endpoint(), Endpoint::new("127.0.0.1", 9857));
        assert_eq!(config.backlog, 10);
        assert_eq!(config.max_message_bytes, 1024 * 1024);
        assert_eq!(config.drain_deadline(), Duration::from_secs(5));
        assert_eq!(config.app, AppType::Echo);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 7000
            backlog = 128
            workers = 4

            [protocol]
            max_message_bytes = 4096
            app = "ping"

            [shutdown]
            drain_deadline_ms = 250

            [logging]
            level = "debug"
            stats_interval = 0
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.protocol.max_message_bytes, 4096);
        assert_eq!(config.protocol.app, AppType::Ping);
        assert_eq!(config.shutdown.drain_deadline_ms, 250);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.stats_interval, 0);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7000
            backlog = 64
            "#,
        )
        .unwrap();
        let args = ServeArgs {
            port: Some(8000),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };

        let config = Config::merge(args, toml_config);
        assert_eq!(config.port, 8000);
        assert_eq!(config.backlog, 64);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validation() {
        let config = Config {
            backlog: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            max_message_bytes: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            workers: Some(0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_cli() {
        let cli = Cli::try_parse_from([
            "frame-echo",
            "serve",
            "--port",
            "0",
            "--app",
            "ping",
            "--drain-deadline-ms",
            "100",
        ])
        .unwrap();
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.port, Some(0));
                assert_eq!(args.app, Some(AppType::Ping));
                assert_eq!(args.drain_deadline_ms, Some(100));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let cli = Cli::try_parse_from(["frame-echo", "send"]).unwrap();
        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.port, DEFAULT_PORT);
                assert_eq!(args.message, DEFAULT_MESSAGE);
                assert_eq!(args.repeat, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
