//! Service configuration.
//!
//! Defaults come from an optional TOML file; every option can be overridden
//! by a `CHERRY_BOT_*` environment variable, which wins over the file.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },
}

/// Review-system connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct GerritConfig {
    pub host: String,

    #[serde(default = "GerritConfig::default_port")]
    pub port: u16,

    pub username: String,

    pub password: String,
}

impl GerritConfig {
    fn default_port() -> u16 {
        443
    }
}

/// Full service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Webhook listen port.
    #[serde(default = "Config::default_listen_port")]
    pub listen_port: u16,

    /// Callers whose webhooks are accepted. Empty means reject everything,
    /// which is safe but useless; configure at least the review server.
    #[serde(default)]
    pub allowed_callers: Vec<IpAddr>,

    pub gerrit: GerritConfig,

    /// Address alerted on systemic failures.
    pub admin_address: String,

    /// SQLite database path.
    #[serde(default = "Config::default_database_path")]
    pub database_path: PathBuf,
}

impl Config {
    fn default_listen_port() -> u16 {
        8083
    }

    fn default_database_path() -> PathBuf {
        PathBuf::from("cherry-bot.db")
    }

    /// Loads configuration from an optional TOML file, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => Config::from_env_only()?,
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Builds a config purely from the environment (no file present).
    fn from_env_only() -> Result<Config, ConfigError> {
        let require = |key: &str, hint: &str| {
            std::env::var(key).map_err(|_| ConfigError::MissingRequired {
                key: key.to_string(),
                hint: hint.to_string(),
            })
        };

        Ok(Config {
            listen_port: Config::default_listen_port(),
            allowed_callers: Vec::new(),
            gerrit: GerritConfig {
                host: require("CHERRY_BOT_GERRIT_HOST", "review server hostname")?,
                port: GerritConfig::default_port(),
                username: require("CHERRY_BOT_GERRIT_USER", "bot account username")?,
                password: require("CHERRY_BOT_GERRIT_PASSWORD", "bot account HTTP password")?,
            },
            admin_address: require("CHERRY_BOT_ADMIN_ADDRESS", "administrator notification address")?,
            database_path: Config::default_database_path(),
        })
    }

    /// Applies `CHERRY_BOT_*` environment variables over the current values.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("CHERRY_BOT_LISTEN_PORT") {
            self.listen_port = parse_env("CHERRY_BOT_LISTEN_PORT", &value)?;
        }
        if let Ok(value) = std::env::var("CHERRY_BOT_ALLOWED_CALLERS") {
            self.allowed_callers = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_env::<IpAddr>("CHERRY_BOT_ALLOWED_CALLERS", s))
                .collect::<Result<_, _>>()?;
        }
        if let Ok(value) = std::env::var("CHERRY_BOT_GERRIT_HOST") {
            self.gerrit.host = value;
        }
        if let Ok(value) = std::env::var("CHERRY_BOT_GERRIT_PORT") {
            self.gerrit.port = parse_env("CHERRY_BOT_GERRIT_PORT", &value)?;
        }
        if let Ok(value) = std::env::var("CHERRY_BOT_GERRIT_USER") {
            self.gerrit.username = value;
        }
        if let Ok(value) = std::env::var("CHERRY_BOT_GERRIT_PASSWORD") {
            self.gerrit.password = value;
        }
        if let Ok(value) = std::env::var("CHERRY_BOT_ADMIN_ADDRESS") {
            self.admin_address = value;
        }
        if let Ok(value) = std::env::var("CHERRY_BOT_DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: format!("expected a valid {}", std::any::type_name::<T>()),
    })
}
