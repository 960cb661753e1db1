//! Application configuration.
//!
//! Layered the usual way: defaults, then `ferry.yaml` in the working
//! directory, then an explicit file, then `FERRY__SECTION__KEY` environment
//! variables.

mod infra;
mod workers;

pub use infra::{DatabaseConfig, RedisConfig, StreamConfig};
pub use workers::{ConsumerConfig, DispatcherConfig};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "ferry.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FERRY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FERRY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FERRY_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace for idempotency and retry keys, and the consumer group name.
    pub service_name: String,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub stream: StreamConfig,
    pub dispatcher: DispatcherConfig,
    pub consumer: ConsumerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "ferry".to_string(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            stream: StreamConfig::default(),
            dispatcher: DispatcherConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `ferry.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///
    /// The result is validated before it is returned.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the background loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.service_name.trim().is_empty() {
            return invalid("service_name must not be empty");
        }
        if self.stream.name.is_empty() || self.stream.dead_letter_name.is_empty() {
            return invalid("stream names must not be empty");
        }
        if self.stream.name == self.stream.dead_letter_name {
            return invalid("stream.dead_letter_name must differ from stream.name");
        }
        if self.dispatcher.batch_size == 0 {
            return invalid("dispatcher.batch_size must be at least 1");
        }
        if self.dispatcher.interval_ms == 0 {
            return invalid("dispatcher.interval_ms must be at least 1");
        }
        if self.consumer.block_ms == 0 {
            return invalid("consumer.block_ms must be at least 1");
        }
        if self.consumer.read_count == 0 {
            return invalid("consumer.read_count must be at least 1");
        }
        if self.consumer.max_retries == 0 {
            return invalid("consumer.max_retries must be at least 1");
        }
        if self.consumer.reclaim_interval_ms == 0 {
            return invalid("consumer.reclaim_interval_ms must be at least 1");
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.service_name, "ferry");
        assert_eq!(config.stream.name, "internal.events");
        assert_eq!(config.stream.dead_letter_name, "internal.events.dlq");
        assert_eq!(config.dispatcher.batch_size, 100);
        assert_eq!(config.dispatcher.interval(), Duration::from_secs(1));
        assert_eq!(config.consumer.max_retries, 10);
        assert_eq!(config.consumer.idempotency_ttl(), Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_same_stream_names() {
        let mut config = Config::for_test();
        config.stream.dead_letter_name = config.stream.name.clone();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = Config::for_test();
        config.dispatcher.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::for_test();
        config.consumer.read_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::for_test();
        config.consumer.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_blocking_reads() {
        let mut config = Config::for_test();
        config.consumer.block_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // A consumer built without validation still blocks for a moment.
        assert_eq!(config.consumer.block(), Duration::from_millis(1));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "service_name: wallets\nstream:\n  name: app.events\n  dead_letter_name: app.events.dlq\nconsumer:\n  max_retries: 3\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.service_name, "wallets");
        assert_eq!(config.stream.name, "app.events");
        assert_eq!(config.consumer.max_retries, 3);
        assert_eq!(config.consumer.read_count, 10);
    }

    #[test]
    #[serial]
    fn test_env_overrides_defaults() {
        std::env::set_var("FERRY__DISPATCHER__BATCH_SIZE", "7");
        let loaded = Config::load(None);
        std::env::remove_var("FERRY__DISPATCHER__BATCH_SIZE");

        assert_eq!(loaded.unwrap().dispatcher.batch_size, 7);
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_values() {
        std::env::set_var("FERRY__CONSUMER__MAX_RETRIES", "0");
        let loaded = Config::load(None);
        std::env::remove_var("FERRY__CONSUMER__MAX_RETRIES");

        assert!(matches!(loaded, Err(ConfigError::Invalid(_))));
    }
}
