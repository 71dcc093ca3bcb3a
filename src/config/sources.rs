use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "REFYNE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/refyne.toml";
const ENV_PREFIX: &str = "REFYNE";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config);
    Ok(config)
}

/// Load secrets from environment variables; never read from TOML files.
fn load_secrets(config: &mut Config) {
    if let Ok(access_key) = env::var("S3_ACCESS_KEY") {
        config.storage.access_key = Some(access_key);
    }
    if let Ok(secret_key) = env::var("S3_SECRET_KEY") {
        config.storage.secret_key = Some(secret_key);
    }
    if config.storage.access_key.is_none() {
        if let Ok(access_key) = env::var("AWS_ACCESS_KEY_ID") {
            config.storage.access_key = Some(access_key);
        }
    }
    if config.storage.secret_key.is_none() {
        if let Ok(secret_key) = env::var("AWS_SECRET_ACCESS_KEY") {
            config.storage.secret_key = Some(secret_key);
        }
    }
    if let Ok(secret) = env::var("CAPTCHA_SHARED_SECRET") {
        config.captcha.shared_secret = Some(secret);
    }
    if let Ok(secret) = env::var("IDENTITY_WEBHOOK_SIGNING_SECRET") {
        config.identity_webhook.signing_secret = Some(secret);
    }
    if let Ok(secret) = env::var("JOB_WEBHOOK_DEFAULT_SECRET") {
        config.webhook.default_secret = Some(secret);
    }
}

/// Load configuration from a specific path and environment.
/// Useful for testing with custom config files.
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.worker.num_workers, 4);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[server]
bind_addr = "127.0.0.1:9000"

[server.api]
max_payload_bytes = "10MB"

[worker]
num_workers = 8
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.server.api.max_payload_bytes.as_u64(), 10 * 1024 * 1024);
        assert_eq!(config.worker.num_workers, 8);
    }

    #[test]
    fn test_full_config_sections() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[storage]
provider = "s3"
bucket = "refyne-prod"
region = "us-east-1"

[chain]
max_retry_attempts = 5

[webhook]
max_attempts = 4

[retention]
job_ttl_days = 14
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.storage.bucket, "refyne-prod");
        assert_eq!(config.chain.max_retry_attempts, 5);
        assert_eq!(config.webhook.max_attempts, 4);
        assert_eq!(config.retention.job_ttl_days, 14);
    }
}
