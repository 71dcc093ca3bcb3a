//! Process-wide counters, exposed via `/operators/health` (spec §6).

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics handle for recording counters/gauges across the job lifecycle,
/// LLM chain execution, crawl engine and webhook dispatcher.
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_accepted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    llm_calls: AtomicU64,
    llm_fallbacks: AtomicU64,
    crawl_pages_fetched: AtomicU64,
    crawl_pages_skipped_protection: AtomicU64,
    webhook_deliveries_sent: AtomicU64,
    webhook_deliveries_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_accepted(&self) {
        self.jobs_accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_accepted", "metric incremented");
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_completed", "metric incremented");
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_failed", "metric incremented");
    }

    pub fn job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_cancelled", "metric incremented");
    }

    pub fn llm_call(&self) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn llm_fallback(&self) {
        self.llm_fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "llm_fallbacks", "metric incremented");
    }

    pub fn crawl_page_fetched(&self) {
        self.crawl_pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn crawl_page_skipped_protection(&self) {
        self.crawl_pages_skipped_protection.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "crawl_pages_skipped_protection", "metric incremented");
    }

    pub fn webhook_delivery_sent(&self) {
        self.webhook_deliveries_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn webhook_delivery_failed(&self) {
        self.webhook_deliveries_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "webhook_deliveries_failed", "metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            llm_fallbacks: self.llm_fallbacks.load(Ordering::Relaxed),
            crawl_pages_fetched: self.crawl_pages_fetched.load(Ordering::Relaxed),
            crawl_pages_skipped_protection: self.crawl_pages_skipped_protection.load(Ordering::Relaxed),
            webhook_deliveries_sent: self.webhook_deliveries_sent.load(Ordering::Relaxed),
            webhook_deliveries_failed: self.webhook_deliveries_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_accepted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub llm_calls: u64,
    pub llm_fallbacks: u64,
    pub crawl_pages_fetched: u64,
    pub crawl_pages_skipped_protection: u64,
    pub webhook_deliveries_sent: u64,
    pub webhook_deliveries_failed: u64,
}
