//! Broker configuration.
//!
//! Loaded from YAML files and environment variables. Every field has a
//! default, so an empty configuration is valid.

use serde::Deserialize;

use crate::queue::{DEFAULT_MAX_QUEUED_MESSAGES, DEFAULT_MAX_STALE_PIPES};
use crate::sync::DEFAULT_MAX_HANDLES_PER_REQUEST;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "pipe-broker.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PIPE_BROKER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PIPE_BROKER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PIPE_BROKER_LOG";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Child broker behaviour.
    pub broker: BrokerConfig,
    /// Synchronous token service limits.
    pub sync: SyncConfig,
}

/// Broker configuration, shared by parent and child brokers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Children are sandboxed and must be started through the synchronous
    /// token service (`spawn_sandboxed_child_broker`).
    pub sync_channel: bool,
    /// Messages that may queue before the parent channel exists.
    pub max_queued_messages: usize,
    /// Pipe ids remembered for late replies: locally resolved pipes in a
    /// child, dead owners' pending pipes in the parent.
    pub max_stale_pipes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            sync_channel: false,
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
            max_stale_pipes: DEFAULT_MAX_STALE_PIPES,
        }
    }
}

/// Synchronous token service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Largest handle or token batch in one request.
    pub max_handles_per_request: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_handles_per_request: DEFAULT_MAX_HANDLES_PER_REQUEST,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `pipe-broker.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
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

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.max_queued_messages == 0 {
            return Err(ConfigError::Invalid(
                "broker.max_queued_messages must be at least 1".to_string(),
            ));
        }
        if self.broker.max_stale_pipes == 0 {
            return Err(ConfigError::Invalid(
                "broker.max_stale_pipes must be at least 1".to_string(),
            ));
        }
        if self.sync.max_handles_per_request == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_handles_per_request must be at least 1".to_string(),
            ));
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

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(!config.broker.sync_channel);
        assert_eq!(config.broker.max_queued_messages, DEFAULT_MAX_QUEUED_MESSAGES);
        assert_eq!(config.broker.max_stale_pipes, DEFAULT_MAX_STALE_PIPES);
        assert_eq!(
            config.sync.max_handles_per_request,
            DEFAULT_MAX_HANDLES_PER_REQUEST
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = Config::for_test();
        config.broker.max_queued_messages = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_stale_pipes() {
        let mut config = Config::for_test();
        config.broker.max_stale_pipes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "broker:\n  sync_channel: true\n  max_queued_messages: 8\n  max_stale_pipes: 32\nsync:\n  max_handles_per_request: 4"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert!(config.broker.sync_channel);
        assert_eq!(config.broker.max_queued_messages, 8);
        assert_eq!(config.broker.max_stale_pipes, 32);
        assert_eq!(config.sync.max_handles_per_request, 4);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "broker:\n  max_queued_messages: 8").unwrap();

        std::env::set_var("PIPE_BROKER__BROKER__MAX_QUEUED_MESSAGES", "16");
        let config = Config::load(file.path().to_str());
        std::env::remove_var("PIPE_BROKER__BROKER__MAX_QUEUED_MESSAGES");

        assert_eq!(config.unwrap().broker.max_queued_messages, 16);
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "sync:\n  max_handles_per_request: 0").unwrap();

        assert!(matches!(
            Config::load(file.path().to_str()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
