use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub crawl: CrawlDefaults,
    #[serde(default)]
    pub dynamic_config: DynamicConfigSettings,
    #[serde(default)]
    pub tiers: TierDefaults,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub identity_webhook: IdentityWebhookConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_fjall_path")]
    pub fjall_path: PathBuf,
    #[serde(default)]
    pub api: ApiLimits,
}

/// API request limits and timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiLimits {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: ByteSize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_llm_route_timeout_secs")]
    pub llm_route_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            fjall_path: default_fjall_path(),
            api: ApiLimits::default(),
        }
    }
}

impl Default for ApiLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
            llm_route_timeout_secs: default_llm_route_timeout_secs(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_fjall_path() -> PathBuf {
    PathBuf::from("data/store")
}

fn default_max_payload_bytes() -> ByteSize {
    ByteSize(5 * 1024 * 1024)
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_llm_route_timeout_secs() -> u64 {
    300
}

/// Object storage provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    S3,
    #[default]
    Local,
}

/// Object storage configuration, used bidirectionally: inbound dynamic config
/// documents and outbound result archives / debug captures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub endpoint: Option<String>,
    #[serde(skip)]
    pub access_key: Option<String>,
    #[serde(skip)]
    pub secret_key: Option<String>,
    pub region: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            bucket: default_bucket(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            region: None,
        }
    }
}

fn default_bucket() -> String {
    "refyne-default".to_string()
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_period_secs")]
    pub shutdown_grace_period_secs: u64,
    #[serde(default = "default_stale_job_max_age_secs")]
    pub stale_job_max_age_secs: u64,
    #[serde(default = "default_stale_check_interval_secs")]
    pub stale_check_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_period_secs: default_shutdown_grace_period_secs(),
            stale_job_max_age_secs: default_stale_job_max_age_secs(),
            stale_check_interval_secs: default_stale_check_interval_secs(),
        }
    }
}

fn default_num_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_shutdown_grace_period_secs() -> u64 {
    300
}

fn default_stale_job_max_age_secs() -> u64 {
    3600
}

fn default_stale_check_interval_secs() -> u64 {
    900
}

/// Fallback chain retry/backoff configuration (spec §4.F)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_rate_limit_base_backoff_secs")]
    pub rate_limit_base_backoff_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            rate_limit_base_backoff_secs: default_rate_limit_base_backoff_secs(),
        }
    }
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_base_backoff_secs() -> u64 {
    2
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_rate_limit_base_backoff_secs() -> u64 {
    5
}

/// LLM executor configuration (spec §4.E)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { default_timeout_secs: default_llm_timeout_secs() }
    }
}

fn default_llm_timeout_secs() -> u64 {
    120
}

/// Hard-coded crawl option defaults (spec §4.H)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlDefaults {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for CrawlDefaults {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_pages: default_max_pages(),
            max_urls: default_max_urls(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_depth() -> u32 {
    1
}

fn default_max_pages() -> usize {
    10
}

fn default_max_urls() -> usize {
    50
}

fn default_concurrency() -> usize {
    3
}

/// Dynamic config loader cache/backoff settings (spec §4.B)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DynamicConfigSettings {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_config_prefix")]
    pub prefix: String,
}

impl Default for DynamicConfigSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            prefix: default_config_prefix(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_error_backoff_secs() -> u64 {
    60
}

fn default_config_prefix() -> String {
    "config".to_string()
}

/// Hard-coded per-tier limits, overridden at runtime by the tier-settings loader.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierLimits {
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: u32,
    #[serde(default = "default_monthly_quota_usd")]
    pub monthly_quota_usd: f64,
    #[serde(default)]
    pub allowed_features: Vec<String>,
    #[serde(default)]
    pub markup_rate: f64,
    #[serde(default)]
    pub balance_floor_usd: f64,
    #[serde(default = "default_max_age_cleanup_days")]
    pub max_age_cleanup_days: u32,
}

fn default_concurrency_cap() -> u32 {
    2
}

fn default_monthly_quota_usd() -> f64 {
    5.0
}

fn default_max_age_cleanup_days() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierDefaults {
    #[serde(default)]
    pub tiers: HashMap<String, TierLimits>,
}

impl Default for TierDefaults {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "free".to_string(),
            TierLimits {
                concurrency_cap: 1,
                monthly_quota_usd: 1.0,
                allowed_features: Vec::new(),
                markup_rate: 0.0,
                balance_floor_usd: 0.0,
                max_age_cleanup_days: default_max_age_cleanup_days(),
            },
        );
        Self { tiers }
    }
}

impl TierDefaults {
    /// Hard fallback for a tier absent from both config and the dynamic loader.
    pub fn fallback() -> TierLimits {
        TierLimits {
            concurrency_cap: default_concurrency_cap(),
            monthly_quota_usd: default_monthly_quota_usd(),
            allowed_features: Vec::new(),
            markup_rate: 0.0,
            balance_floor_usd: -5.0,
            max_age_cleanup_days: default_max_age_cleanup_days(),
        }
    }

    pub fn get(&self, tier: &str) -> TierLimits {
        self.tiers.get(tier).cloned().unwrap_or_else(Self::fallback)
    }
}

/// Webhook dispatcher configuration (spec §4.K)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_webhook_signature_window_secs")]
    pub signature_window_secs: i64,
    /// Signing secret for per-job completion deliveries (spec §4.K), loaded
    /// from the environment only — never from TOML (see `config::sources`).
    #[serde(skip)]
    pub default_secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_webhook_max_attempts(),
            timeout_secs: default_webhook_timeout_secs(),
            signature_window_secs: default_webhook_signature_window_secs(),
            default_secret: None,
        }
    }
}

fn default_webhook_max_attempts() -> u32 {
    3
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_webhook_signature_window_secs() -> i64 {
    300
}

/// Captcha/dynamic-content service client configuration (spec §4.N)
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CaptchaConfig {
    pub base_url: Option<String>,
    #[serde(skip)]
    pub shared_secret: Option<String>,
    #[serde(default = "default_captcha_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_captcha_timeout_secs() -> u64 {
    10
}

impl CaptchaConfig {
    pub fn enabled(&self) -> bool {
        self.base_url.is_some() && self.shared_secret.is_some()
    }
}

/// External-IdP lifecycle webhook (spec §6 `POST /webhooks/clerk`):
/// Svix-style signature verification against the inbound provider webhook.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityWebhookConfig {
    #[serde(skip)]
    pub signing_secret: Option<String>,
    #[serde(default = "default_identity_webhook_tolerance_secs")]
    pub tolerance_secs: i64,
}

fn default_identity_webhook_tolerance_secs() -> i64 {
    300
}

impl Default for IdentityWebhookConfig {
    fn default() -> Self {
        Self { signing_secret: None, tolerance_secs: default_identity_webhook_tolerance_secs() }
    }
}

impl IdentityWebhookConfig {
    pub fn enabled(&self) -> bool {
        self.signing_secret.is_some()
    }
}

/// Idle monitor configuration (spec §4.M)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdleConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            excluded_paths: default_excluded_paths(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_excluded_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/operators/health".to_string(),
    ]
}

/// Retention / cleanup scheduler configuration (spec §4.L)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_job_ttl_days")]
    pub job_ttl_days: u32,
    #[serde(default = "default_debug_capture_ttl_days")]
    pub debug_capture_ttl_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_store_max_bytes")]
    pub store_max_bytes: ByteSize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_ttl_days: default_job_ttl_days(),
            debug_capture_ttl_days: default_debug_capture_ttl_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            store_max_bytes: default_store_max_bytes(),
        }
    }
}

fn default_job_ttl_days() -> u32 {
    30
}

fn default_debug_capture_ttl_days() -> u32 {
    7
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_store_max_bytes() -> ByteSize {
    ByteSize(50 * 1024 * 1024 * 1024)
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_addr: default_metrics_addr(),
            otlp_endpoint: None,
        }
    }
}

fn default_metrics_addr() -> SocketAddr {
    "0.0.0.0:9090".parse().unwrap()
}
