//! Captcha / dynamic-content client signer (spec §4.N): a timestamp-bound
//! HMAC request signer for the outbound JSON-RPC-style call to the
//! dynamic-content microservice, plus `fly-replay-src` session affinity.
//!
//! Grounded on the webhook dispatcher's HMAC primitives (`webhook::sign`),
//! generalized from "sign an inbound delivery" to "sign an outbound request";
//! the crawl engine only sees this through the `ProtectionBypass` seam it
//! already defines.

use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crawl::ProtectionBypass;
use crate::webhook::sign;

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("hmac key of invalid length")]
    InvalidKey,

    #[error("dynamic-content service returned status {0}")]
    BadStatus(u16),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CaptchaError>;

/// Canonical message for outbound requests to the dynamic-content service:
/// `"{timestamp}|{url}|{sha256(body)}"`.
fn canonical_message(timestamp: i64, url: &str, body: &[u8]) -> String {
    let body_hash = hex_encode(Sha256::digest(body));
    format!("{timestamp}|{url}|{body_hash}")
}

fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    use std::fmt::Write;
    bytes.as_ref().iter().fold(String::with_capacity(bytes.as_ref().len() * 2), |mut acc, byte| {
        let _ = write!(acc, "{byte:02x}");
        acc
    })
}

/// Client for the dynamic-content (captcha-bypass) microservice. Pins
/// subsequent requests to whatever target the service's `fly-replay-src`
/// response header names, so a solved challenge's session state is reused.
pub struct CaptchaClient {
    http: reqwest::Client,
    base_url: String,
    shared_secret: String,
    timeout_secs: u64,
    replay_target: Arc<AsyncMutex<Option<String>>>,
}

impl CaptchaClient {
    pub fn new(base_url: String, shared_secret: String, timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            shared_secret,
            timeout_secs,
            replay_target: Arc::new(AsyncMutex::new(None)),
        }
    }

    /// Calls `POST {base_url}/v1` with the signed request body `{"url": url}`,
    /// returning the rendered HTML on success.
    pub async fn solve(&self, url: &str) -> Result<String> {
        let body = serde_json::json!({ "url": url });
        let body_bytes = serde_json::to_vec(&body)?;

        let timestamp = Utc::now().timestamp();
        let message = canonical_message(timestamp, url, &body_bytes);
        let signature = sign(&self.shared_secret, &message).map_err(|_| CaptchaError::InvalidKey)?;

        let mut request = self
            .http
            .post(format!("{}/v1", self.base_url))
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .header("x-refyne-signature", signature)
            .header("x-refyne-timestamp", timestamp.to_string())
            .json(&body);

        if let Some(target) = self.replay_target.lock().await.clone() {
            request = request.header("fly-replay", target);
        }

        let response = request.send().await?;

        if let Some(replay_src) = response.headers().get("fly-replay-src") {
            if let Ok(value) = replay_src.to_str() {
                *self.replay_target.lock().await = Some(value.to_string());
            }
        }

        if !response.status().is_success() {
            return Err(CaptchaError::BadStatus(response.status().as_u16()));
        }

        #[derive(serde::Deserialize)]
        struct SolveResponse {
            html: String,
        }
        let parsed: SolveResponse = response.json().await?;
        Ok(parsed.html)
    }
}

#[async_trait]
impl ProtectionBypass for CaptchaClient {
    async fn solve(&self, url: &str) -> Option<String> {
        match CaptchaClient::solve(self, url).await {
            Ok(html) => Some(html),
            Err(error) => {
                tracing::warn!(url, %error, "captcha bypass failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_message_is_stable_for_same_inputs() {
        let a = canonical_message(1000, "https://site.test/a", b"{}");
        let b = canonical_message(1000, "https://site.test/a", b"{}");
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_message_changes_with_url() {
        let a = canonical_message(1000, "https://site.test/a", b"{}");
        let b = canonical_message(1000, "https://site.test/b", b"{}");
        assert_ne!(a, b);
    }
}
