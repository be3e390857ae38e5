//! Agency configuration.
//!
//! Read from a YAML file (a missing default file is fine), then overridden by
//! `CLI_*` environment variables.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::session::{AckMode, RetryPolicy, SessionConfig};

pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgencyConfig {
    pub id: String,
    pub server: ServerConfig,
    pub batch: BatchConfig,
    pub log: LogConfig,
    pub data: DataConfig,
    pub connection: ConnectionConfig,
    pub winners: WinnersConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    #[serde(alias = "maxAmount")]
    pub max_amount: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_amount: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(deserialize_with = "deserialize_level")]
    pub level: String,
}

fn normalize_level(level: &str) -> String {
    level.trim().to_ascii_lowercase()
}

fn deserialize_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    String::deserialize(deserializer).map(|level| normalize_level(&level))
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Defaults to `/data/agency-<id>.csv`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub per_batch: bool,
    pub ack: AckMode,
    pub ack_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WinnersConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for WinnersConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long an in-flight exchange may run after a shutdown signal.
    pub grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_ms: 2000 }
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { key, value }),
    }
}

fn parse_ack_mode(key: &'static str, value: String) -> Result<AckMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "last_number" | "number" => Ok(AckMode::LastNumber),
        "flag" | "bool" => Ok(AckMode::Flag),
        _ => Err(ConfigError::InvalidEnv { key, value }),
    }
}

impl AgencyConfig {
    /// Load from `path` (or `./config.yaml`) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (file, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let mut config = match std::fs::read_to_string(&file) {
            Ok(yaml) => Self::from_yaml(&yaml)?,
            Err(e) if !explicit && e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %file.display(), "Config file not found, using environment only");
                Self::default()
            }
            Err(source) => return Err(ConfigError::Read { path: file, source }),
        };

        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CLI_ID") {
            self.id = v.trim().to_string();
        }
        if let Some(v) = lookup("CLI_SERVER_ADDRESS") {
            self.server.address = v.trim().to_string();
        }
        if let Some(v) = lookup("CLI_BATCH_MAXAMOUNT") {
            self.batch.max_amount = parse_env("CLI_BATCH_MAXAMOUNT", v)?;
        }
        if let Some(v) = lookup("CLI_LOG_LEVEL") {
            self.log.level = normalize_level(&v);
        }
        if let Some(v) = lookup("CLI_DATA_PATH") {
            self.data.path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = lookup("CLI_CONNECTION_PERBATCH") {
            self.connection.per_batch = parse_bool("CLI_CONNECTION_PERBATCH", v)?;
        }
        if let Some(v) = lookup("CLI_CONNECTION_ACK") {
            self.connection.ack = parse_ack_mode("CLI_CONNECTION_ACK", v)?;
        }
        if let Some(v) = lookup("CLI_CONNECTION_ACKTIMEOUTMS") {
            self.connection.ack_timeout_ms = Some(parse_env("CLI_CONNECTION_ACKTIMEOUTMS", v)?);
        }
        if let Some(v) = lookup("CLI_WINNERS_MAXATTEMPTS") {
            self.winners.max_attempts = parse_env("CLI_WINNERS_MAXATTEMPTS", v)?;
        }
        if let Some(v) = lookup("CLI_WINNERS_DELAYMS") {
            self.winners.delay_ms = parse_env("CLI_WINNERS_DELAYMS", v)?;
        }
        if let Some(v) = lookup("CLI_SHUTDOWN_GRACEMS") {
            self.shutdown.grace_ms = parse_env("CLI_SHUTDOWN_GRACEMS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::Validation("id is required".to_string()));
        }
        if self.server.address.is_empty() {
            return Err(ConfigError::Validation(
                "server.address is required".to_string(),
            ));
        }
        if self.batch.max_amount == 0 {
            return Err(ConfigError::Validation(
                "batch.max_amount must be at least 1".to_string(),
            ));
        }
        if self.winners.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "winners.max_attempts must be at least 1".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "log.level must be one of: {}",
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    pub fn data_path(&self) -> PathBuf {
        self.data
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/data/agency-{}.csv", self.id)))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connection.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.id.clone())
            .with_batch_max_amount(self.batch.max_amount)
            .with_ack_mode(self.connection.ack)
            .with_connection_per_batch(self.connection.per_batch)
            .with_winners_retry(RetryPolicy::new(
                self.winners.max_attempts,
                Duration::from_millis(self.winners.delay_ms),
            ))
            .with_reply_timeout(self.connection.ack_timeout_ms.map(Duration::from_millis))
    }
}
