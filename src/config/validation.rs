use super::models::{Config, StorageProvider};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("max_payload_bytes ({actual}) exceeds hard limit of 5MB ({limit})")]
    PayloadSizeExceedsLimit { actual: u64, limit: u64 },

    #[error("storage provider is s3 but missing credentials (access_key or secret_key)")]
    MissingS3Credentials,

    #[error("worker.num_workers must be at least 1")]
    NoWorkers,

    #[error("chain.max_retry_attempts must be at least 1")]
    InvalidMaxRetryAttempts,

    #[error("webhook.max_attempts must be at least 1")]
    InvalidWebhookMaxAttempts,

    #[error("retention TTL must be positive: {field} = {value}")]
    InvalidRetentionTTL { field: String, value: u32 },

    #[error("retention.store_max_bytes must be positive")]
    InvalidStoreMaxBytes,

    #[error("captcha base_url must use http(s), got '{scheme}'")]
    InvalidCaptchaScheme { scheme: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_payload_size(config)?;
    validate_storage(config)?;
    validate_worker(config)?;
    validate_chain(config)?;
    validate_webhook(config)?;
    validate_retention(config)?;
    validate_captcha(config)?;
    Ok(())
}

fn validate_payload_size(config: &Config) -> Result<(), ValidationError> {
    const MAX_PAYLOAD_BYTES: u64 = 5 * 1024 * 1024;
    if config.server.api.max_payload_bytes.as_u64() > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadSizeExceedsLimit {
            actual: config.server.api.max_payload_bytes.as_u64(),
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    if config.storage.provider == StorageProvider::S3
        && (config.storage.access_key.is_none() || config.storage.secret_key.is_none())
    {
        return Err(ValidationError::MissingS3Credentials);
    }
    Ok(())
}

fn validate_worker(config: &Config) -> Result<(), ValidationError> {
    if config.worker.num_workers == 0 {
        return Err(ValidationError::NoWorkers);
    }
    Ok(())
}

fn validate_chain(config: &Config) -> Result<(), ValidationError> {
    if config.chain.max_retry_attempts == 0 {
        return Err(ValidationError::InvalidMaxRetryAttempts);
    }
    Ok(())
}

fn validate_webhook(config: &Config) -> Result<(), ValidationError> {
    if config.webhook.max_attempts == 0 {
        return Err(ValidationError::InvalidWebhookMaxAttempts);
    }
    Ok(())
}

fn validate_retention(config: &Config) -> Result<(), ValidationError> {
    if config.retention.job_ttl_days == 0 {
        return Err(ValidationError::InvalidRetentionTTL {
            field: "job_ttl_days".to_string(),
            value: 0,
        });
    }
    if config.retention.debug_capture_ttl_days == 0 {
        return Err(ValidationError::InvalidRetentionTTL {
            field: "debug_capture_ttl_days".to_string(),
            value: 0,
        });
    }
    if config.retention.store_max_bytes.as_u64() == 0 {
        return Err(ValidationError::InvalidStoreMaxBytes);
    }
    Ok(())
}

fn validate_captcha(config: &Config) -> Result<(), ValidationError> {
    if let Some(base_url) = &config.captcha.base_url {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            let scheme = base_url.split("://").next().unwrap_or(base_url).to_string();
            return Err(ValidationError::InvalidCaptchaScheme { scheme });
        }
    }
    Ok(())
}
