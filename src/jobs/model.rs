//! Data model for the job lifecycle manager (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of work a Job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Extract,
    Crawl,
    Analyze,
}

/// Lifecycle status of a Job. Transitions are monotonic except
/// pending->running, which may revert to pending only via stale-claim
/// recovery (`jobs::repository::mark_stale_running_jobs_failed` actually
/// fails them rather than requeueing, matching spec §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// One entry of a resolved LLM fallback chain, snapshotted onto a Job at
/// creation time (spec §3 FallbackChainEntry, §9 "Snapshot").
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainEntry {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub strict_mode: Option<bool>,
}

/// Crawl options, defaults applied by `crate::config::CrawlDefaults` where a
/// field is omitted by the caller (spec §4.H).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlOptions {
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub max_urls: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub same_domain_only: bool,
    #[serde(default)]
    pub extract_from_seeds: bool,
    #[serde(default)]
    pub follow_selector: Option<String>,
    #[serde(default)]
    pub follow_pattern: Option<String>,
    #[serde(default)]
    pub next_selector: Option<String>,
    /// Minimum gap between fetches to the same host, e.g. "500ms".
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default)]
    pub discovery_method: DiscoveryMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    #[default]
    Auto,
    Sitemap,
    Links,
}

/// Machine-readable error category, shared by the classifier, chain runner,
/// crawl engine and job repository (spec §4.D / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    QuotaExceeded,
    ProviderError,
    InvalidKey,
    ModelUnsupported,
    ContentTooLong,
    Timeout,
    NoModels,
    TierQuota,
    TierFeature,
    Protection,
    InsufficientCredits,
    StaleWorker,
    WorkerPanic,
    Cancelled,
    Unknown,
}

/// A Job: the unit of work claimed by the worker pool (spec §3 Job).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub seed_url: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub crawl_options: Option<CrawlOptions>,
    pub chain_snapshot: Vec<ChainEntry>,
    pub tier_snapshot: String,
    #[serde(default)]
    pub byok: bool,

    #[serde(default)]
    pub urls_queued: u64,
    #[serde(default)]
    pub page_count: u64,
    #[serde(default)]
    pub token_in: u64,
    #[serde(default)]
    pub token_out: u64,

    #[serde(default)]
    pub user_charge_usd: f64,
    #[serde(default)]
    pub llm_cost_usd: f64,

    #[serde(default)]
    pub last_provider: Option<String>,
    #[serde(default)]
    pub last_model: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_details: Option<String>,
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,

    #[serde(default)]
    pub capture_debug: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a freshly-created pending job. Timestamps are supplied by the
    /// caller (clock & ID service, component A) so this constructor stays
    /// pure and testable.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        id: String,
        user_id: String,
        kind: JobKind,
        seed_url: String,
        schema: serde_json::Value,
        crawl_options: Option<CrawlOptions>,
        chain_snapshot: Vec<ChainEntry>,
        tier_snapshot: String,
        byok: bool,
        capture_debug: bool,
        webhook_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            kind,
            status: JobStatus::Pending,
            seed_url,
            schema,
            crawl_options,
            chain_snapshot,
            tier_snapshot,
            byok,
            urls_queued: 0,
            page_count: 0,
            token_in: 0,
            token_out: 0,
            user_charge_usd: 0.0,
            llm_cost_usd: 0.0,
            last_provider: None,
            last_model: None,
            error_message: None,
            error_details: None,
            error_category: None,
            capture_debug,
            webhook_url,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Crawl status of a single page within a job (spec §3 JobResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    Crawling,
    Completed,
    Failed,
    Skipped,
}

/// Per-URL record attached to a Job. Exactly one row per (job_id, url).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub url: String,
    #[serde(default)]
    pub parent_url: Option<String>,
    pub depth: u32,
    pub crawl_status: CrawlStatus,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_details: Option<String>,
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub token_in: u64,
    #[serde(default)]
    pub token_out: u64,
    #[serde(default)]
    pub fetch_duration_ms: Option<u64>,
    #[serde(default)]
    pub extract_duration_ms: Option<u64>,
    /// Monotonic per-job insertion order, used for pagination since the
    /// embedded store keys results by (job_id, url) rather than by sequence.
    pub seq: u64,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobResult {
    pub fn new_pending(job_id: String, url: String, parent_url: Option<String>, depth: u32, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            url,
            parent_url,
            depth,
            crawl_status: CrawlStatus::Pending,
            data: None,
            error_message: None,
            error_details: None,
            error_category: None,
            provider: None,
            model: None,
            retry_count: 0,
            token_in: 0,
            token_out: 0,
            fetch_duration_ms: None,
            extract_duration_ms: None,
            seq,
            discovered_at: now,
            completed_at: None,
        }
    }
}

/// Running balance for a user (spec §3 UserBalance).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserBalance {
    pub user_id: String,
    pub balance_usd: f64,
    pub lifetime_added: f64,
    pub lifetime_spent: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Type of a CreditTransaction ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Subscription,
    Topup,
    Usage,
    Expiry,
    Refund,
    Adjustment,
}

/// Append-only ledger row (spec §3 CreditTransaction).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount_usd: f64,
    pub balance_after: f64,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_payment_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Lean billing columns (spec §3 UsageRecord).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageRecord {
    pub job_id: String,
    pub user_id: String,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub total_charged_usd: f64,
    pub is_byok: bool,
}

/// Rich telemetry paired 1:1 with a UsageRecord (spec §3 UsageInsight).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageInsight {
    pub job_id: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub generation_id: Option<String>,
    pub fetch_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub token_in: u64,
    pub token_out: u64,
    pub markup_rate: f64,
}

/// Deduplicated schema snapshot, unique per (user_id, hash) (spec §3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaSnapshot {
    pub user_id: String,
    pub hash: String,
    pub schema: serde_json::Value,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

/// API key record. The plaintext key is returned once at creation and never
/// persisted; only `key_hash`/`key_prefix` live in the store (spec §3 APIKey).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    /// Billing tier the key authenticates as, mirrored onto every job it
    /// submits as `tier_snapshot` (spec §3 supplemental: the Authenticator
    /// seam needs a tier without a round trip to a separate user record).
    #[serde(default = "default_api_key_tier")]
    pub tier: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
}

fn default_api_key_tier() -> String {
    "free".to_string()
}

impl ApiKey {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

/// Webhook subscription (spec §3 Webhook).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Webhook {
    pub id: String,
    pub user_id: String,
    pub url: String,
    /// HMAC secret, encrypted at rest by the caller before it reaches this
    /// store; this module treats it as an opaque byte string.
    pub secret: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Delivery status of one WebhookDelivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Retrying,
    Failed,
}

/// Per-attempt delivery row (spec §3 WebhookDelivery).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookDelivery {
    pub job_id: String,
    /// Nulled when the owning webhook is deleted (audit rows survive).
    pub webhook_id: Option<String>,
    pub seq: u64,
    pub event: String,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub attempt_number: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_result_depth_zero_has_no_parent_by_construction() {
        let now = Utc::now();
        let result = JobResult::new_pending("job_1".into(), "https://example.com/".into(), None, 0, 0, now);
        assert_eq!(result.depth, 0);
        assert!(result.parent_url.is_none());
    }

    #[test]
    fn test_api_key_expiry() {
        let now = Utc::now();
        let mut key = ApiKey {
            id: "k1".into(),
            user_id: "u1".into(),
            name: "test".into(),
            key_hash: "hash".into(),
            key_prefix: "rf_abc".into(),
            tier: "free".into(),
            scopes: vec![],
            last_used_at: None,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            created_at: now,
            revoked_at: None,
        };
        assert!(!key.is_active(now));
        key.expires_at = None;
        assert!(key.is_active(now));
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let now = Utc::now();
        let job = Job::new_pending(
            "job_1".into(),
            "user_1".into(),
            JobKind::Extract,
            "https://example.com/a".into(),
            serde_json::json!({"title": "string"}),
            None,
            vec![ChainEntry {
                provider: "openrouter".into(),
                model: "openai/gpt-4o-mini".into(),
                temperature: None,
                max_tokens: None,
                strict_mode: None,
            }],
            "free".into(),
            false,
            false,
            None,
            now,
        );
        let encoded = serde_json::to_vec(&job).unwrap();
        let decoded: Job = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.id, "job_1");
        assert_eq!(decoded.status, JobStatus::Pending);
        assert_eq!(decoded.chain_snapshot.len(), 1);
    }
}
