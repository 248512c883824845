//! Operator configuration with layered resolution.
//!
//! Highest priority first: CLI flags, `EK_*` environment variables, the config file
//! (`--config <path>` or `./extraction-kernel.toml`), compiled defaults.

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "extraction-kernel.toml";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config file {path} could not be read: {message}")]
    Unreadable { path: String, message: String },
    #[error("config file {path} is not valid TOML: {message}")]
    Parse { path: String, message: String },
    #[error("environment variable {name}={value:?} is invalid: {message}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        message: String,
    },
    #[error("config value {field} is invalid: {message}")]
    Validation { field: &'static str, message: String },
}

impl ConfigError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreadable { .. } | Self::Parse { .. } => "config_file",
            Self::InvalidEnv { .. } => "config_env",
            Self::Validation { .. } => "config_invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./extraction_kernel.sqlite3"),
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MigrateConfig {
    /// Zero fails fast when another migrator holds the lock.
    pub lock_wait_ms: u64,
    pub holder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Install the principal-identity source on the migrator connection.
    pub trust_boundary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DocsConfig {
    pub root: PathBuf,
    pub forbidden: Vec<String>,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("docs"),
            forbidden: vec!["migrate down".to_string(), "alembic downgrade".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub migrate: MigrateConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub docs: DocsConfig,
}

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub db: Option<PathBuf>,
    pub trust_boundary: Option<bool>,
    pub lock_wait_ms: Option<u64>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl Config {
    pub fn load(explicit: Option<&Path>, overrides: &CliOverrides) -> Result<Self, ConfigError> {
        Self::load_with_env(explicit, overrides, |name| std::env::var(name).ok())
    }

    pub fn load_with_env(
        explicit: Option<&Path>,
        overrides: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let implicit = Path::new(DEFAULT_CONFIG_FILE);
                if implicit.exists() {
                    Self::from_file(implicit)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(env)?;
        config.apply_cli(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError::Parse {
            path: "<string>".to_string(),
            message: err.to_string(),
        })
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Unreadable {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        toml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(path) = env("EK_DB") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(value) = env("EK_TRUST_BOUNDARY") {
            self.auth.trust_boundary = parse_flag("EK_TRUST_BOUNDARY", &value)?;
        }
        if let Some(value) = env("EK_LOCK_WAIT_MS") {
            self.migrate.lock_wait_ms =
                value
                    .trim()
                    .parse()
                    .map_err(|err: std::num::ParseIntError| ConfigError::InvalidEnv {
                        name: "EK_LOCK_WAIT_MS",
                        value: value.clone(),
                        message: err.to_string(),
                    })?;
        }
        if let Some(level) = env("EK_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    fn apply_cli(&mut self, overrides: &CliOverrides) {
        if let Some(db) = &overrides.db {
            self.database.path.clone_from(db);
        }
        if let Some(trust_boundary) = overrides.trust_boundary {
            self.auth.trust_boundary = trust_boundary;
        }
        if let Some(lock_wait_ms) = overrides.lock_wait_ms {
            self.migrate.lock_wait_ms = lock_wait_ms;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level.clone_from(level);
        }
        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.busy_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                field: "database.busy_timeout_ms",
                message: "must be greater than 0".to_string(),
            });
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                field: "database.path",
                message: "must not be empty".to_string(),
            });
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "logging.level",
                message: "must not be empty".to_string(),
            });
        }
        if self.docs.forbidden.iter().all(|phrase| phrase.trim().is_empty()) {
            return Err(ConfigError::Validation {
                field: "docs.forbidden",
                message: "must list at least one phrase".to_string(),
            });
        }
        if self
            .migrate
            .holder
            .as_deref()
            .is_some_and(|holder| holder.trim().is_empty())
        {
            return Err(ConfigError::Validation {
                field: "migrate.holder",
                message: "must not be blank when set".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
            message: "expected true or false".to_string(),
        }),
    }
}
