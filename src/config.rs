//! Configuration module for the logecho server.
//!
//! Everything has a built-in default, so running with no arguments serves
//! on port 9000 and records to `/var/tmp/aesdsocketdata`. An optional TOML
//! file can override the defaults, and CLI arguments override both.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "logecho")]
#[command(version)]
#[command(about = "Append newline-terminated messages to a log and play the log back", long_about = None)]
pub struct CliArgs {
    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Path of the shared log file
    #[arg(short = 'f', long)]
    pub data_file: Option<PathBuf>,

    /// What to do with bytes from a connection that closes before its newline
    #[arg(long, value_enum)]
    pub partial_records: Option<PartialRecords>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Handling of data received from a session that never completes a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PartialRecords {
    /// Append every chunk as it arrives; an unterminated tail stays in the log.
    #[default]
    Keep,
    /// Hold chunks until the newline arrives; an unterminated tail is discarded.
    Drop,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Run detached from the terminal
    #[serde(default)]
    pub daemon: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            daemon: false,
        }
    }
}

/// Log store configuration
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// Path of the shared log file
    #[serde(default = "default_data_file")]
    pub path: PathBuf,
    #[serde(default)]
    pub partial_records: PartialRecords,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_data_file(),
            partial_records: PartialRecords::default(),
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

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub daemon: bool,
    /// Always absolute, so detaching (which changes directory to `/`) does not move it.
    pub data_file: PathBuf,
    pub partial_records: PartialRecords,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values. CLI arguments take precedence.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let data_file = cli.data_file.unwrap_or(toml_config.store.path);
        let data_file = if data_file.is_relative() {
            std::env::current_dir()
                .map_err(ConfigError::CurrentDir)?
                .join(data_file)
        } else {
            data_file
        };

        Ok(Config {
            listen,
            daemon: cli.daemon || toml_config.server.daemon,
            data_file,
            partial_records: cli
                .partial_records
                .unwrap_or(toml_config.store.partial_records),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    CurrentDir(std::io::Error),
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
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{addr}'")
            }
            ConfigError::CurrentDir(e) => {
                write!(f, "Failed to resolve working directory: {e}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.data_file, PathBuf::from("/var/tmp/aesdsocketdata"));
        assert_eq!(config.partial_records, PartialRecords::Keep);
        assert!(!config.daemon);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_daemon_flag() {
        let cli = CliArgs::try_parse_from(["logecho", "-d"]).unwrap();
        let config = Config::merge(cli, TomlConfig::default()).unwrap();
        assert!(config.daemon);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9100"
            daemon = true

            [store]
            path = "/tmp/records"
            partial_records = "drop"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9100");
        assert!(config.server.daemon);
        assert_eq!(config.store.path, PathBuf::from("/tmp/records"));
        assert_eq!(config.store.partial_records, PartialRecords::Drop);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9100"

            [store]
            partial_records = "drop"
        "#,
        )
        .unwrap();
        let cli = CliArgs::try_parse_from([
            "logecho",
            "--listen",
            "127.0.0.1:9200",
            "--partial-records",
            "keep",
            "--log-level",
            "warn",
        ])
        .unwrap();

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9200".parse().unwrap());
        assert_eq!(config.partial_records, PartialRecords::Keep);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_relative_data_file_is_made_absolute() {
        let cli = CliArgs::try_parse_from(["logecho", "-f", "records.log"]).unwrap();
        let config = Config::merge(cli, TomlConfig::default()).unwrap();
        assert!(config.data_file.is_absolute());
        assert!(config.data_file.ends_with("records.log"));
    }

    #[test]
    fn test_invalid_listen_address() {
        let cli = CliArgs::try_parse_from(["logecho", "-l", "not-an-address"]).unwrap();
        match Config::merge(cli, TomlConfig::default()) {
            Err(ConfigError::InvalidListen(addr)) => assert_eq!(addr, "not-an-address"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
