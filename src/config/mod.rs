//! Application configuration.
//!
//! Aggregates configuration into a single Config struct that can be loaded
//! from YAML files or environment variables.

mod messaging;

pub use messaging::{
    AmqpSettings, InProcessSettings, MessagingConfig, MessagingType, RequestConfig,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "computer-bus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COMPUTER_BUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COMPUTER_BUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COMPUTER_BUS_LOG";

use serde::Deserialize;

use crate::error::BusError;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging configuration.
    pub messaging: MessagingConfig,
    /// Request/reply configuration.
    pub request: RequestConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `computer-bus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, BusError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BusError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| BusError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, BusError> {
        serde_yaml::from_str(content).map_err(|e| BusError::Config(e.to_string()))
    }
}
