//! Request/response DTOs for the public HTTP surface (spec §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::model::{ChainEntry, CrawlOptions, ErrorCategory, Job, JobKind, JobResult, JobStatus};

/// Shared body of `POST /extract` and `POST /crawl`: the two job kinds only
/// differ in which options are meaningful, not in the envelope shape.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub url: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub chain: Vec<ChainEntry>,
    #[serde(default)]
    pub crawl_options: Option<CrawlOptions>,
    #[serde(default)]
    pub byok_keys: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    pub capture_debug: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Caller-supplied dedup token (spec §3): repeating a key within the
    /// idempotency window returns the job created on the first request
    /// instead of creating a duplicate.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobAcceptedResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub seed_url: String,
    pub tier_snapshot: String,
    pub byok: bool,
    pub urls_queued: u64,
    pub page_count: u64,
    pub token_in: u64,
    pub token_out: u64,
    pub user_charge_usd: f64,
    pub last_provider: Option<String>,
    pub last_model: Option<String>,
    pub error_message: Option<String>,
    /// Admin/provider diagnostics; populated only for BYOK callers (spec §6
    /// "no raw error_details for non-BYOK users").
    pub error_details: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let error_details = job.byok.then_some(job.error_details).flatten();
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            seed_url: job.seed_url,
            tier_snapshot: job.tier_snapshot,
            byok: job.byok,
            urls_queued: job.urls_queued,
            page_count: job.page_count,
            token_in: job.token_in,
            token_out: job.token_out,
            user_charge_usd: job.user_charge_usd,
            last_provider: job.last_provider,
            last_model: job.last_model,
            error_message: job.error_message,
            error_details,
            error_category: job.error_category,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResultView {
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: u32,
    pub status: crate::jobs::model::CrawlStatus,
    pub data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobResultView {
    /// `byok` gates `error_details` the same way `JobView` does (spec §6).
    pub fn from_result(result: JobResult, byok: bool) -> Self {
        Self {
            url: result.url,
            parent_url: result.parent_url,
            depth: result.depth,
            status: result.crawl_status,
            data: result.data,
            error_message: result.error_message,
            error_details: byok.then_some(result.error_details).flatten(),
            error_category: result.error_category,
            provider: result.provider,
            model: result.model,
            discovered_at: result.discovered_at,
            completed_at: result.completed_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResultsPage {
    pub results: Vec<JobResultView>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub category: Option<ErrorCategory>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorHealthResponse {
    pub status: &'static str,
    pub metrics: crate::observability::MetricsSnapshot,
    pub active_jobs: usize,
}
