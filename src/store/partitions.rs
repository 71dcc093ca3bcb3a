//! Key layout and encoding utilities for Fjall partitions
//!
//! Partition structure:
//! - `jobs`: job:{job_id} -> Job (JSON)
//! - `job_results`: result:{job_id}:{url} -> JobResult (JSON); dedup is the key
//!   itself, pagination ordering uses the `seq` field stored on the row
//! - `balances`: balance:{user_id} -> UserBalance (JSON)
//! - `credit_transactions`: credit:{user_id}:{seq:020} -> CreditTransaction
//!   (JSON), append-only
//! - `usage_records`: usage:{job_id} -> UsageRecord (JSON); the key doubles as
//!   the unique-per-job constraint, giving idempotent accounting for free
//! - `schema_snapshots`: schema:{user_id}:{hash} -> SchemaSnapshot (JSON)
//! - `api_keys`: apikey:{key_hash} -> APIKey (JSON)
//! - `webhooks`: webhook:{webhook_id} -> Webhook (JSON)
//! - `webhook_deliveries`: delivery:{job_id}:{seq:020} -> WebhookDelivery (JSON)
//! - `idempotency`: idem:{key} -> job_id (string)
//! - `metadata`: meta:{key} -> value (JSON/string)

/// Encode a job key: job:{job_id}
pub fn encode_job_key(job_id: &str) -> Vec<u8> {
    format!("job:{job_id}").into_bytes()
}

/// Decode a job key: job:{job_id} -> job_id
pub fn decode_job_key(key: &[u8]) -> Option<String> {
    std::str::from_utf8(key).ok()?.strip_prefix("job:").map(String::from)
}

/// Encode a job result key: result:{job_id}:{url}
pub fn encode_result_key(job_id: &str, url: &str) -> Vec<u8> {
    format!("result:{job_id}:{url}").into_bytes()
}

/// Encode a result prefix for range scan: result:{job_id}:
pub fn encode_result_prefix(job_id: &str) -> Vec<u8> {
    format!("result:{job_id}:").into_bytes()
}

/// Encode a balance key: balance:{user_id}
pub fn encode_balance_key(user_id: &str) -> Vec<u8> {
    format!("balance:{user_id}").into_bytes()
}

/// Encode a credit transaction key: credit:{user_id}:{seq:020}
pub fn encode_credit_key(user_id: &str, seq: u64) -> Vec<u8> {
    format!("credit:{user_id}:{seq:020}").into_bytes()
}

/// Encode a credit transaction prefix for range scan: credit:{user_id}:
pub fn encode_credit_prefix(user_id: &str) -> Vec<u8> {
    format!("credit:{user_id}:").into_bytes()
}

/// Encode a usage record key: usage:{job_id}
pub fn encode_usage_key(job_id: &str) -> Vec<u8> {
    format!("usage:{job_id}").into_bytes()
}

/// Encode a schema snapshot key: schema:{user_id}:{hash}
pub fn encode_schema_key(user_id: &str, hash: &str) -> Vec<u8> {
    format!("schema:{user_id}:{hash}").into_bytes()
}

/// Encode an API key record key: apikey:{key_hash}
pub fn encode_api_key_key(key_hash: &str) -> Vec<u8> {
    format!("apikey:{key_hash}").into_bytes()
}

/// Encode a webhook key: webhook:{webhook_id}
pub fn encode_webhook_key(webhook_id: &str) -> Vec<u8> {
    format!("webhook:{webhook_id}").into_bytes()
}

/// Encode a webhook delivery key: delivery:{job_id}:{seq:020}
pub fn encode_delivery_key(job_id: &str, seq: u64) -> Vec<u8> {
    format!("delivery:{job_id}:{seq:020}").into_bytes()
}

/// Encode a webhook delivery prefix for range scan: delivery:{job_id}:
pub fn encode_delivery_prefix(job_id: &str) -> Vec<u8> {
    format!("delivery:{job_id}:").into_bytes()
}

/// Encode an idempotency key: idem:{key}
pub fn encode_idem_key(key: &str) -> Vec<u8> {
    format!("idem:{key}").into_bytes()
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{key}").into_bytes()
}
