//! Configuration management for the core engine
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use refyne_core::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Server listening on: {}", config.server.bind_addr);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `REFYNE__<section>__<key>`
//!
//! Examples:
//! - `REFYNE__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `REFYNE__WORKER__NUM_WORKERS=8`
//! - `REFYNE__STORAGE__BUCKET=refyne-prod`
//!
//! Hard-coded fallbacks in this module (tier limits, model defaults, backoff
//! constants) are overridden first by the S3-backed dynamic config loaders in
//! [`crate::dynamic_config`], then by whatever this layer resolves for
//! anything the dynamic loaders don't cover (bind address, store path,
//! shutdown grace, poll interval).
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/refyne.toml`.
//! This can be overridden using the `REFYNE_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    ApiLimits, CaptchaConfig, ChainConfig, Config, CrawlDefaults, DynamicConfigSettings,
    IdentityWebhookConfig, IdleConfig, LlmConfig, RetentionConfig, ServerConfig, StorageConfig,
    StorageProvider, TelemetryConfig, TierDefaults, TierLimits, WebhookConfig, WorkerConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`REFYNE__*`)
    /// 2. TOML file (default: `config/refyne.toml`)
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path. Useful for tests.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(&config_path, "[worker]\nnum_workers = 6\n").unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.worker.num_workers, 6);
    }

    #[test]
    fn test_validation_catches_bad_worker_count() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(&config_path, "[worker]\nnum_workers = 0\n").unwrap();

        let result = Config::load_from_path(config_path);
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::NoWorkers)
        ));
    }

    #[test]
    fn test_full_config_example() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[server]
bind_addr = "0.0.0.0:8080"

[storage]
provider = "local"
bucket = "refyne-default"

[worker]
num_workers = 4

[chain]
max_retry_attempts = 3

[retention]
job_ttl_days = 30

[telemetry]
metrics_addr = "0.0.0.0:9090"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.worker.num_workers, 4);
        assert_eq!(config.retention.job_ttl_days, 30);
        assert_eq!(config.tiers.get("free").concurrency_cap, 1);
    }
}
