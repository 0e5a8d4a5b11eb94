//! Application configuration.
//!
//! Aggregates the broker endpoint and the pin map into a single `Config`
//! that can be loaded from YAML/JSON files or environment variables.

mod connection;
mod router;

pub use connection::{
    ConnectionConfig, DEFAULT_MAX_RECOVERY_ATTEMPTS, DEFAULT_MAX_RECOVERY_TIMEOUT,
    DEFAULT_MIN_RECOVERY_TIMEOUT,
};
pub use router::{
    FieldFilter, FilterSpec, Operation, PinConfig, RouterConfig, EVENT_ATTRIBUTE,
    PUBLISH_ATTRIBUTE, SUBSCRIBE_ATTRIBUTE,
};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "pinbus.yaml";
/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "PINBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PINBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PINBUS_LOG";

/// Error raised while loading or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to parse router configuration: {0}")]
    Router(#[from] serde_json::Error),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker endpoint settings.
    pub connection: ConnectionConfig,
    /// Pin routing map.
    pub router: RouterConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overrides earlier:
    /// 1. `pinbus.yaml` in the current directory (if present)
    /// 2. File given by `path` (if provided)
    /// 3. File given by `PINBUS_CONFIG` (if set)
    /// 4. `PINBUS`-prefixed environment variables (`__` separator)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::with_name(config_path).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Loads only a router configuration from its JSON wire form on disk.
    pub fn load_router(path: &str) -> Result<RouterConfig, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(RouterConfig::from_json(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.connection.port, 5672);
        assert!(config.router.queues.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
connection:
  host: rabbit
  username: guest
  password: guest
router:
  queues:
    out:
      name: key.out
      attributes: [publish]
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.connection.host, "rabbit");
        assert_eq!(config.router.queues["out"].routing_key, "key.out");
    }

    #[test]
    fn test_load_router_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"queues": {{"in": {{"name": "key.in", "queue": "q.in", "attributes": ["subscribe"]}}}}}}"#
        )
        .unwrap();

        let router = Config::load_router(file.path().to_str().unwrap()).unwrap();
        assert_eq!(router.queues["in"].queue_name, "q.in");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(Config::load(Some("/definitely/not/here.yaml")).is_err());
    }
}
