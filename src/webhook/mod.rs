//! Webhook dispatcher (spec §4.K): HMAC-signed delivery with bounded
//! exponential backoff, each attempt recorded as a WebhookDelivery row.
//!
//! Grounded on the teacher's download-client retry shape, generalized from
//! "retry a GET" to "retry a signed POST with a persisted attempt ledger".

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::chain::calculate_backoff;
use crate::config::{ChainConfig, WebhookConfig};
use crate::jobs::model::{DeliveryStatus, ErrorCategory, Webhook, WebhookDelivery};
use crate::store::partitions::{encode_delivery_key, encode_delivery_prefix, encode_meta_key};
use crate::store::FjallStore;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("hmac key of invalid length")]
    InvalidKey,
}

pub type Result<T> = std::result::Result<T, WebhookError>;

/// Canonical signing message per spec §4.K:
/// `"{timestamp}|{user_id}|{tier}|{features}|{job_id}|{sha256(body)}"`.
pub fn canonical_message(timestamp: i64, user_id: &str, tier: &str, features: &[String], job_id: &str, body: &[u8]) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{timestamp}|{user_id}|{tier}|{}|{job_id}|{body_hash}", features.join(","))
}

/// Signs `message` with `secret`, returning a lowercase-hex digest.
pub fn sign(secret: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Generates a fresh random signing secret for deployments that don't
/// configure `WebhookConfig::default_secret` (hex-encoded, 256 bits).
pub fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Verifies a received signature in constant time and rejects timestamps
/// outside the replay window (spec §4.K: 5 minutes by default).
pub fn verify(secret: &str, message: &str, signature: &str, timestamp: i64, now: i64, window_secs: i64) -> bool {
    if (now - timestamp).abs() > window_secs {
        return false;
    }
    match sign(secret, message) {
        Ok(expected) => expected.as_bytes().ct_eq(signature.as_bytes()).into(),
        Err(_) => false,
    }
}

/// Tiny hex encoder so the webhook module doesn't need the `base64` crate's
/// hex-adjacent cousin for one digest format; kept local and minimal.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        bytes.as_ref().iter().fold(String::with_capacity(bytes.as_ref().len() * 2), |mut acc, byte| {
            let _ = write!(acc, "{byte:02x}");
            acc
        })
    }
}

pub struct WebhookDispatcher {
    http: reqwest::Client,
    store: FjallStore,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(store: FjallStore, config: WebhookConfig) -> Self {
        Self { http: reqwest::Client::new(), store, config }
    }

    /// Delivers one event to `webhook`, retrying with the chain's backoff
    /// curve up to `max_attempts`. Records a WebhookDelivery row per attempt.
    /// Returns `Ok(true)` if delivery succeeded, `Ok(false)` if every attempt
    /// was rejected or unreachable; only a signing or store error is `Err`.
    pub async fn deliver(&self, webhook: &Webhook, event: &str, job_id: &str, tier: &str, features: &[String], data: &serde_json::Value, chain_config: &ChainConfig) -> Result<bool> {
        let body = serde_json::json!({ "event": event, "job_id": job_id, "timestamp": Utc::now().timestamp(), "data": data });
        let body_bytes = serde_json::to_vec(&body)?;

        for attempt in 0..self.config.max_attempts {
            let timestamp = Utc::now().timestamp();
            let message = canonical_message(timestamp, &webhook.user_id, tier, features, job_id, &body_bytes);
            let signature = sign(&webhook.secret, &message)?;

            let attempt_started = std::time::Instant::now();
            let response = self
                .http
                .post(&webhook.url)
                .timeout(std::time::Duration::from_secs(self.config.timeout_secs))
                .header("x-refyne-signature", signature)
                .header("x-refyne-timestamp", timestamp.to_string())
                .headers(build_custom_headers(webhook))
                .json(&body)
                .send()
                .await;
            let response_time_ms = attempt_started.elapsed().as_millis() as u64;

            let (status_code, succeeded) = match &response {
                Ok(resp) => (Some(resp.status().as_u16()), resp.status().is_success()),
                Err(_) => (None, false),
            };

            let is_last_attempt = attempt + 1 >= self.config.max_attempts;
            let status = if succeeded {
                DeliveryStatus::Success
            } else if is_last_attempt {
                DeliveryStatus::Failed
            } else {
                DeliveryStatus::Retrying
            };

            let next_retry_at = (!succeeded && !is_last_attempt).then(|| Utc::now() + calculate_backoff(attempt, ErrorCategory::ProviderError, chain_config));

            self.record_delivery(job_id, Some(webhook.id.clone()), event, status_code, Some(response_time_ms), attempt + 1, self.config.max_attempts, next_retry_at, status)?;

            if succeeded {
                return Ok(true);
            }
            if is_last_attempt {
                return Ok(false);
            }

            let backoff = calculate_backoff(attempt, ErrorCategory::ProviderError, chain_config);
            tokio::time::sleep(backoff).await;
        }

        Ok(false)
    }

    fn record_delivery(
        &self,
        job_id: &str,
        webhook_id: Option<String>,
        event: &str,
        status_code: Option<u16>,
        response_time_ms: Option<u64>,
        attempt_number: u32,
        max_attempts: u32,
        next_retry_at: Option<DateTime<Utc>>,
        status: DeliveryStatus,
    ) -> Result<()> {
        let seq = self.next_delivery_seq(job_id)?;
        let delivery = WebhookDelivery {
            job_id: job_id.to_string(),
            webhook_id,
            seq,
            event: event.to_string(),
            status_code,
            response_time_ms,
            attempt_number,
            max_attempts,
            next_retry_at,
            status,
            created_at: Utc::now(),
        };
        let key = encode_delivery_key(job_id, seq);
        self.store.put_json(&self.store.webhook_deliveries, key, &delivery)?;
        Ok(())
    }

    fn next_delivery_seq(&self, job_id: &str) -> Result<u64> {
        let _guard = self.store.claim_lock.lock().unwrap();
        let meta_key = encode_meta_key(&format!("delivery_seq:{job_id}"));
        let current: u64 = match self.store.metadata.get(&meta_key)? {
            Some(bytes) => std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(0),
            None => 0,
        };
        let next = current + 1;
        self.store.metadata.insert(meta_key, next.to_string().as_bytes())?;
        Ok(next)
    }

    pub fn list_deliveries(&self, job_id: &str) -> Result<Vec<WebhookDelivery>> {
        let prefix = encode_delivery_prefix(job_id);
        let mut deliveries: Vec<WebhookDelivery> = self.store.scan_prefix_json(&self.store.webhook_deliveries, &prefix)?;
        deliveries.sort_by_key(|d| d.seq);
        Ok(deliveries)
    }
}

fn build_custom_headers(webhook: &Webhook) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &webhook.custom_headers {
        if let (Ok(name), Ok(value)) = (reqwest::header::HeaderName::try_from(name.as_str()), reqwest::header::HeaderValue::try_from(value.as_str())) {
            headers.insert(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic() {
        let message = canonical_message(1000, "user_1", "free", &["extract".to_string()], "job_1", b"{}");
        assert_eq!(sign("secret", &message).unwrap(), sign("secret", &message).unwrap());
    }

    #[test]
    fn test_verify_rejects_stale_timestamp() {
        let message = canonical_message(1000, "user_1", "free", &[], "job_1", b"{}");
        let signature = sign("secret", &message).unwrap();
        assert!(!verify("secret", &message, &signature, 1000, 1000 + 400, 300));
        assert!(verify("secret", &message, &signature, 1000, 1000 + 200, 300));
    }

    #[test]
    fn test_verify_rejects_wrong_signature() {
        let message = canonical_message(1000, "user_1", "free", &[], "job_1", b"{}");
        assert!(!verify("secret", &message, "deadbeef", 1000, 1000, 300));
    }

    #[tokio::test]
    async fn test_deliver_records_attempts_against_unreachable_url() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = FjallStore::open(temp.path().join("store")).unwrap();
        let dispatcher = WebhookDispatcher::new(store, WebhookConfig { max_attempts: 2, timeout_secs: 1, signature_window_secs: 300, default_secret: None });

        let webhook = Webhook {
            id: "wh_1".into(),
            user_id: "user_1".into(),
            url: "http://127.0.0.1:1/webhook".into(),
            secret: "secret".into(),
            event_types: vec!["job.completed".into()],
            custom_headers: Default::default(),
            active: true,
            created_at: Utc::now(),
        };

        let chain_config = ChainConfig { max_retry_attempts: 3, base_backoff_secs: 0, max_backoff_secs: 0, rate_limit_base_backoff_secs: 0 };
        let delivered = dispatcher.deliver(&webhook, "job.completed", "job_1", "free", &["extract".to_string()], &serde_json::json!({}), &chain_config).await.unwrap();
        assert!(!delivered);

        let deliveries = dispatcher.list_deliveries("job_1").unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries.last().unwrap().status, DeliveryStatus::Failed);
    }
}
