//! Configuration module for the wirebench server.
//!
//! Settings are layered: command-line arguments take precedence over TOML
//! file values, which take precedence over built-in defaults. Benchmark
//! scenario parameters and the metrics file suffix come from the
//! environment, matching how the benchmark harness launches each node.

use clap::Parser;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Command-line arguments for the benchmark server.
#[derive(Parser, Debug)]
#[command(name = "wirebench")]
#[command(author = "wirebench authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP latency benchmark server with a custom binary protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:5000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Directory the metrics CSV is written under
    #[arg(long)]
    pub metrics_dir: Option<PathBuf>,

    /// Simulated per-request processing delay in milliseconds
    #[arg(long)]
    pub processing_delay_ms: Option<u64>,

    /// Node identifier reported in responses and metrics rows
    /// (defaults to the OS hostname)
    #[arg(long)]
    pub server_id: Option<String>,

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
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Simulated per-request processing delay in milliseconds
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,
    /// Node identifier override
    pub id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            processing_delay_ms: default_processing_delay_ms(),
            id: None,
        }
    }
}

/// Metrics-sink configuration
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Directory the CSV log is written under
    #[serde(default = "default_metrics_dir")]
    pub dir: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            dir: default_metrics_dir(),
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
    "0.0.0.0:5000".to_string()
}

fn default_processing_delay_ms() -> u64 {
    1
}

fn default_metrics_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Scenario-size counters copied verbatim into every metrics row.
///
/// Purely informational: they record how many servers, clients, and messages
/// the surrounding benchmark scenario was launched with.
#[derive(Debug, Clone)]
pub struct ScenarioParams {
    pub num_servers: String,
    pub num_clients: String,
    pub num_messages: String,
}

impl ScenarioParams {
    /// Read `NUM_SERVERS`, `NUM_CLIENTS`, and `NUM_MESSAGES` from the
    /// environment; unset counters become `unknown`.
    pub fn from_env() -> Self {
        Self {
            num_servers: env_or_unknown("NUM_SERVERS"),
            num_clients: env_or_unknown("NUM_CLIENTS"),
            num_messages: env_or_unknown("NUM_MESSAGES"),
        }
    }
}

fn env_or_unknown(key: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub metrics_dir: PathBuf,
    /// Optional suffix inserted into the metrics file name, from
    /// `TIMESTAMP_SUFFIX`. Keeps concurrent benchmark runs apart.
    pub metrics_suffix: String,
    pub processing_delay_ms: u64,
    pub server_id: String,
    pub scenario: ScenarioParams,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args, optional TOML file, and the
    /// environment. CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
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

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            metrics_dir: cli.metrics_dir.unwrap_or(toml_config.metrics.dir),
            metrics_suffix: env::var("TIMESTAMP_SUFFIX").unwrap_or_default(),
            processing_delay_ms: cli
                .processing_delay_ms
                .unwrap_or(toml_config.server.processing_delay_ms),
            server_id: cli
                .server_id
                .or(toml_config.server.id)
                .unwrap_or_else(default_server_id),
            scenario: ScenarioParams::from_env(),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Path of the metrics CSV, including any environment suffix.
    pub fn metrics_path(&self) -> PathBuf {
        self.metrics_dir
            .join(format!("requests{}.csv", self.metrics_suffix))
    }
}

/// Node identifier: the OS hostname, or `unknown` when it cannot be read.
pub fn default_server_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
