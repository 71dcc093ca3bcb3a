//! Worker pool (spec §4.I): N cooperative pollers claiming pending jobs,
//! dispatching to the chain runner (Extract) or crawl engine (Crawl),
//! finalizing accounting, and delivering the job's webhook notification.
//!
//! Grounded on the teacher's download-worker pool (`worker::pool::Pool`),
//! generalized from "download one resource per claim" to "run a job's full
//! lifecycle per claim", including the panic-isolation one spawned task
//! per claim buys for free.

pub mod idle;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::accounting::{calculate_llm_cost, calculate_user_charge, AccountingLedger, InsightInput};
use crate::chain::ChainRunner;
use crate::config::{ChainConfig, CrawlDefaults, TierDefaults, WebhookConfig};
use crate::crawl::CrawlEngine;
use crate::dynamic_config::DynamicConfigRegistry;
use crate::jobs::model::{CrawlOptions, DiscoveryMethod, ErrorCategory, Job, JobKind, JobStatus, Webhook};
use crate::jobs::repository::JobRepository;
use crate::observability::Metrics;
use crate::webhook::WebhookDispatcher;

/// Resolves the LLM provider credentials a job should run with. BYOK keys
/// are supplied at request time and never persisted (spec §3 "BYOK"); this
/// seam lets the API layer hand them to the worker without the job
/// repository ever storing a secret.
#[async_trait]
pub trait ApiKeyResolver: Send + Sync {
    async fn resolve(&self, job: &Job) -> HashMap<String, String>;
}

/// Resolver backed by a fixed set of platform-owned provider keys, used for
/// every non-BYOK job. BYOK jobs need a richer resolver supplied by the API
/// layer (e.g. one backed by a per-request cache); this is the sane default.
pub struct StaticApiKeyResolver {
    keys: HashMap<String, String>,
}

impl StaticApiKeyResolver {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl ApiKeyResolver for StaticApiKeyResolver {
    async fn resolve(&self, _job: &Job) -> HashMap<String, String> {
        self.keys.clone()
    }
}

pub struct WorkerPool {
    repository: Arc<dyn JobRepository>,
    chain_runner: Arc<ChainRunner>,
    crawl_engine: Arc<CrawlEngine>,
    accounting: Arc<AccountingLedger>,
    dynamic_config: Arc<DynamicConfigRegistry>,
    webhook_dispatcher: Arc<WebhookDispatcher>,
    api_key_resolver: Arc<dyn ApiKeyResolver>,
    metrics: Arc<Metrics>,
    tiers: TierDefaults,
    crawl_defaults: CrawlDefaults,
    chain_config: ChainConfig,
    webhook_secret: String,
    num_workers: usize,
    poll_interval: Duration,
    shutdown_grace_period: Duration,
    stale_job_max_age: chrono::Duration,
    stale_check_interval: Duration,
    active_jobs: Arc<AtomicUsize>,
}

#[allow(clippy::too_many_arguments)]
impl WorkerPool {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        chain_runner: Arc<ChainRunner>,
        crawl_engine: Arc<CrawlEngine>,
        accounting: Arc<AccountingLedger>,
        dynamic_config: Arc<DynamicConfigRegistry>,
        webhook_dispatcher: Arc<WebhookDispatcher>,
        api_key_resolver: Arc<dyn ApiKeyResolver>,
        metrics: Arc<Metrics>,
        tiers: TierDefaults,
        crawl_defaults: CrawlDefaults,
        chain_config: ChainConfig,
        webhook_config: WebhookConfig,
        num_workers: usize,
        poll_interval_ms: u64,
        shutdown_grace_period_secs: u64,
        stale_job_max_age_secs: u64,
        stale_check_interval_secs: u64,
    ) -> Self {
        let webhook_secret = webhook_config.default_secret.clone().unwrap_or_else(crate::webhook::generate_secret);
        Self {
            repository,
            chain_runner,
            crawl_engine,
            accounting,
            dynamic_config,
            webhook_dispatcher,
            api_key_resolver,
            metrics,
            tiers,
            crawl_defaults,
            chain_config,
            webhook_secret,
            num_workers,
            poll_interval: Duration::from_millis(poll_interval_ms),
            shutdown_grace_period: Duration::from_secs(shutdown_grace_period_secs),
            stale_job_max_age: chrono::Duration::seconds(stale_job_max_age_secs as i64),
            stale_check_interval: Duration::from_secs(stale_check_interval_secs),
            active_jobs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Read by the idle monitor (spec §4.I "`ActiveJobs()`").
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Runs the pool until `shutdown` fires, then gives in-flight jobs up
    /// to `shutdown_grace_period` to finish before returning (spec §4.I). A
    /// job still running past the grace period is left `running` — it is
    /// recovered on next boot by `mark_stale_running_jobs_failed`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        for worker_id in 0..self.num_workers {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { pool.worker_loop(worker_id, shutdown).await });
        }

        {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { pool.stale_reaper_loop(shutdown).await });
        }

        shutdown.cancelled().await;
        let _ = tokio::time::timeout(self.shutdown_grace_period, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => return,
            }

            let job = match self.repository.claim_pending().await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(worker_id, %error, "claim_pending failed");
                    continue;
                }
            };

            self.active_jobs.fetch_add(1, Ordering::SeqCst);
            let pool = self.clone();
            let job_id = job.id.clone();
            let handle = tokio::spawn(async move { pool.process_job(job).await });

            if let Err(join_error) = handle.await {
                tracing::error!(job_id = %job_id, %join_error, "worker task panicked");
                let _ = self
                    .repository
                    .update_atomic(
                        &job_id,
                        JobStatus::Running,
                        Box::new(|j| {
                            j.status = JobStatus::Failed;
                            j.error_category = Some(ErrorCategory::WorkerPanic);
                            j.error_message = Some("worker task panicked".to_string());
                            j.completed_at = Some(Utc::now());
                        }),
                    )
                    .await;
                self.metrics.job_failed();
            }

            self.active_jobs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn stale_reaper_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.stale_check_interval) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.repository.mark_stale_running_jobs_failed(self.stale_job_max_age).await {
                Ok(count) if count > 0 => tracing::info!(count, "recovered stale running jobs"),
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "stale job reap failed"),
            }
        }
    }

    async fn process_job(&self, job: Job) {
        let tier_limits = self.tiers.get(&job.tier_snapshot);
        let model_defaults = self.dynamic_config.model_defaults.current().await;
        let pricing = self.dynamic_config.pricing.current().await;
        let api_keys = self.api_key_resolver.resolve(&job).await;
        let cancellation = CancellationToken::new();

        let mut crawl_job = job.clone();
        if job.kind != JobKind::Crawl {
            crawl_job.crawl_options = Some(single_page_options());
        }

        let summary = self.crawl_engine.run(&crawl_job, &self.crawl_defaults, &api_keys, &model_defaults, &self.chain_config, &cancellation).await;

        let llm_cost_usd = calculate_llm_cost(&summary.usages, &pricing);
        let user_charge_usd = calculate_user_charge(llm_cost_usd, job.byok, tier_limits.markup_rate);

        let mut status = if summary.pages_succeeded == 0 && (summary.pages_failed > 0 || summary.fatal_error.is_some()) {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };

        let insight = InsightInput {
            provider: summary.last_provider.clone().unwrap_or_default(),
            model: summary.last_model.clone().unwrap_or_default(),
            generation_id: summary.last_generation_id.clone(),
            fetch_duration_ms: summary.total_fetch_duration_ms,
            extract_duration_ms: summary.total_extract_duration_ms,
            token_in: summary.token_in,
            token_out: summary.token_out,
            markup_rate: tier_limits.markup_rate,
        };
        let accounting_outcome = self.accounting.finalize_job(&job.id, &job.user_id, job.kind, status, user_charge_usd, job.byok, tier_limits.balance_floor_usd, insight);

        let error_category = if accounting_outcome.is_err() {
            status = JobStatus::Failed;
            Some(ErrorCategory::InsufficientCredits)
        } else {
            summary.fatal_error.as_ref().map(|e| e.category)
        };
        let error_message = summary.fatal_error.as_ref().map(|e| e.user_message.clone());
        let error_details = summary.fatal_error.as_ref().map(|e| e.raw_message.clone());

        let final_status = status;
        let last_provider = summary.last_provider.clone();
        let last_model = summary.last_model.clone();
        let token_in = summary.token_in;
        let token_out = summary.token_out;
        let urls_queued = summary.urls_queued;
        let page_count = summary.pages_succeeded + summary.pages_failed;

        let updated = self
            .repository
            .update_atomic(
                &job.id,
                JobStatus::Running,
                Box::new(move |j| {
                    j.status = final_status;
                    j.token_in = token_in;
                    j.token_out = token_out;
                    j.urls_queued = urls_queued;
                    j.page_count = page_count;
                    j.llm_cost_usd = llm_cost_usd;
                    j.user_charge_usd = user_charge_usd;
                    j.last_provider = last_provider;
                    j.last_model = last_model;
                    j.error_category = error_category;
                    j.error_message = error_message;
                    j.error_details = error_details;
                    j.completed_at = Some(Utc::now());
                }),
            )
            .await;

        match final_status {
            JobStatus::Completed => self.metrics.job_completed(),
            _ => self.metrics.job_failed(),
        }

        if let (Ok(updated_job), Some(webhook_url)) = (&updated, &job.webhook_url) {
            self.dispatch_webhook(updated_job, webhook_url).await;
        }
    }

    async fn dispatch_webhook(&self, job: &Job, webhook_url: &str) {
        let webhook = Webhook {
            id: format!("job-webhook:{}", job.id),
            user_id: job.user_id.clone(),
            url: webhook_url.to_string(),
            secret: self.webhook_secret.clone(),
            event_types: vec!["job.completed".to_string()],
            custom_headers: Default::default(),
            active: true,
            created_at: Utc::now(),
        };
        let event = match job.status {
            JobStatus::Completed => "job.completed",
            _ => "job.failed",
        };
        let payload = serde_json::json!({
            "job_id": job.id,
            "status": job.status,
            "page_count": job.page_count,
            "token_in": job.token_in,
            "token_out": job.token_out,
        });
        match self.webhook_dispatcher.deliver(&webhook, event, &job.id, &job.tier_snapshot, &[], &payload, &self.chain_config).await {
            Ok(true) => self.metrics.webhook_delivery_sent(),
            Ok(false) => self.metrics.webhook_delivery_failed(),
            Err(error) => {
                tracing::warn!(job_id = %job.id, %error, "webhook dispatch errored");
                self.metrics.webhook_delivery_failed();
            }
        }
    }
}

fn single_page_options() -> CrawlOptions {
    CrawlOptions {
        max_depth: Some(0),
        max_pages: Some(1),
        max_urls: Some(0),
        concurrency: Some(1),
        same_domain_only: false,
        extract_from_seeds: true,
        follow_selector: None,
        follow_pattern: None,
        next_selector: None,
        delay: None,
        discovery_method: DiscoveryMethod::Links,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_page_options_has_zero_depth() {
        let options = single_page_options();
        assert_eq!(options.max_depth, Some(0));
        assert_eq!(options.max_pages, Some(1));
    }
}
