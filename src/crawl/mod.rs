//! Crawl engine (spec §4.H): seed queue, sitemap-or-link discovery, a
//! bounded BFS worker pool, protection-signal routing, and per-page
//! extraction via the fallback chain runner.
//!
//! Grounded on the teacher's worker-pool fetch loop (`worker::pool`),
//! generalized from "fetch N resources with a semaphore" to "discover and
//! extract a frontier of pages with a growing queue".

pub mod discovery;
pub mod protection;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::accounting::TokenUsage;
use crate::chain::ChainRunner;
use crate::classifier::LlmError;
use crate::config::{ChainConfig, CrawlDefaults};
use crate::dynamic_config::ModelDefaultsDoc;
use crate::jobs::model::{CrawlStatus, DiscoveryMethod, ErrorCategory, Job, JobResult};
use crate::jobs::repository::JobRepository;
use crate::observability::Metrics;

/// Bypasses a detected protection challenge (spec §4.N, the dynamic-content
/// service). Implemented by the captcha module; the crawl engine only needs
/// this narrow seam so it can stay ignorant of the HMAC signing concern.
#[async_trait]
pub trait ProtectionBypass: Send + Sync {
    async fn solve(&self, url: &str) -> Option<String>;
}

/// Aggregated outcome of one job's crawl, handed back to the worker so it
/// can finalize the Job row and run accounting.
#[derive(Debug, Default)]
pub struct CrawlSummary {
    pub urls_queued: u64,
    pub pages_succeeded: u64,
    pub pages_failed: u64,
    pub token_in: u64,
    pub token_out: u64,
    pub usages: Vec<TokenUsage>,
    pub last_provider: Option<String>,
    pub last_model: Option<String>,
    pub last_generation_id: Option<String>,
    pub total_fetch_duration_ms: u64,
    pub total_extract_duration_ms: u64,
    /// Set when the whole job must fail even though some pages may have
    /// completed (spec §4.H step 4: "failed if zero pages succeeded and at
    /// least one attempt errored fatally").
    pub fatal_error: Option<LlmError>,
}

struct ResolvedOptions {
    max_depth: u32,
    max_pages: usize,
    max_urls: usize,
    concurrency: usize,
    same_domain_only: bool,
    follow_pattern: Option<String>,
    discovery_method: DiscoveryMethod,
    delay: Duration,
    extract_from_seeds: bool,
}

impl ResolvedOptions {
    fn resolve(job: &Job, defaults: &CrawlDefaults) -> Self {
        let options = job.crawl_options.as_ref();
        Self {
            max_depth: options.and_then(|o| o.max_depth).unwrap_or(defaults.max_depth),
            max_pages: options.and_then(|o| o.max_pages).unwrap_or(defaults.max_pages),
            max_urls: options.and_then(|o| o.max_urls).unwrap_or(defaults.max_urls),
            concurrency: options.and_then(|o| o.concurrency).unwrap_or(defaults.concurrency).max(1),
            same_domain_only: options.map(|o| o.same_domain_only).unwrap_or(false),
            follow_pattern: options.and_then(|o| o.follow_pattern.clone()),
            discovery_method: options.map(|o| o.discovery_method).unwrap_or_default(),
            delay: options.and_then(|o| o.delay.as_deref()).and_then(parse_delay).unwrap_or(Duration::ZERO),
            extract_from_seeds: options.map(|o| o.extract_from_seeds).unwrap_or(false),
        }
    }
}

/// Parses durations like `"500ms"` / `"2s"` — the small fixed shape the
/// crawl options actually use, not a general duration-string crate.
fn parse_delay(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = raw.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    raw.parse::<u64>().ok().map(Duration::from_millis)
}

/// Per-host minimum-delay throttle shared by all in-flight fetches for a job.
#[derive(Default)]
struct HostThrottle {
    last_fetch: AsyncMutex<HashMap<String, Instant>>,
}

impl HostThrottle {
    async fn wait_turn(&self, host: &str, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let sleep_for = {
            let mut guard = self.last_fetch.lock().await;
            let now = Instant::now();
            let sleep_for = guard.get(host).map(|last| delay.saturating_sub(now.duration_since(*last))).unwrap_or(Duration::ZERO);
            guard.insert(host.to_string(), now + sleep_for);
            sleep_for
        };
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Clone)]
pub struct CrawlEngine {
    http: reqwest::Client,
    chain_runner: Arc<ChainRunner>,
    repository: Arc<dyn JobRepository>,
    metrics: Arc<Metrics>,
    protection_bypass: Option<Arc<dyn ProtectionBypass>>,
}

impl CrawlEngine {
    pub fn new(chain_runner: Arc<ChainRunner>, repository: Arc<dyn JobRepository>, metrics: Arc<Metrics>, protection_bypass: Option<Arc<dyn ProtectionBypass>>) -> Self {
        Self { http: reqwest::Client::new(), chain_runner, repository, metrics, protection_bypass }
    }

    /// Runs the full BFS crawl for `job`. The caller (worker) owns the Job
    /// row's status transition; this only writes JobResult rows and returns
    /// the aggregate counters.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        job: &Job,
        crawl_defaults: &CrawlDefaults,
        api_keys: &HashMap<String, String>,
        model_defaults: &ModelDefaultsDoc,
        chain_config: &ChainConfig,
        cancellation: &CancellationToken,
    ) -> CrawlSummary {
        let options = ResolvedOptions::resolve(job, crawl_defaults);
        let summary = Arc::new(AsyncMutex::new(CrawlSummary::default()));

        if options.extract_from_seeds {
            let seed = JobResult::new_pending(job.id.clone(), job.seed_url.clone(), None, 0, 0, Utc::now());
            if self.repository.insert_result(seed).await.is_ok() {
                summary.lock().await.urls_queued += 1;
            }
        }

        if options.discovery_method != DiscoveryMethod::Links {
            self.discover_via_sitemap(job, &options, &summary).await;
        }

        let throttle = Arc::new(HostThrottle::default());
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let pages_done = {
                let guard = summary.lock().await;
                guard.pages_succeeded + guard.pages_failed
            };
            if pages_done as usize >= options.max_pages {
                break;
            }

            match self.repository.claim_next_pending_result(&job.id).await {
                Ok(Some(result)) => {
                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
                    let engine = self.clone();
                    let job_clone = job.clone();
                    let api_keys = api_keys.clone();
                    let model_defaults = model_defaults.clone();
                    let chain_config = chain_config.clone();
                    let cancellation = cancellation.clone();
                    let throttle = throttle.clone();
                    let summary = summary.clone();
                    let options_snapshot = options.snapshot();

                    tasks.spawn(async move {
                        let _permit = permit;
                        engine
                            .process_page(&job_clone, result, &options_snapshot, &api_keys, &model_defaults, &chain_config, &throttle, &cancellation, &summary)
                            .await;
                    });
                }
                Ok(None) => {
                    if tasks.is_empty() {
                        break;
                    }
                    tasks.join_next().await;
                }
                Err(error) => {
                    tracing::warn!(job_id = %job.id, %error, "failed to claim next pending crawl result");
                    break;
                }
            }
        }

        while tasks.join_next().await.is_some() {}

        Arc::try_unwrap(summary).expect("all spawned tasks have completed and dropped their summary handle").into_inner()
    }

    async fn discover_via_sitemap(&self, job: &Job, options: &ResolvedOptions, summary: &Arc<AsyncMutex<CrawlSummary>>) {
        let Ok(seed) = Url::parse(&job.seed_url) else { return };
        let sitemap_url = format!("{}://{}/sitemap.xml", seed.scheme(), seed.authority());

        let Ok(response) = self.http.get(&sitemap_url).send().await else { return };
        if !response.status().is_success() {
            return;
        }
        let Ok(body) = response.text().await else { return };

        let urls = discovery::parse_sitemap(&body, options.max_urls);
        for url in urls {
            let result = JobResult::new_pending(job.id.clone(), url, None, 1, 0, Utc::now());
            if let Ok(true) = self.repository.insert_result(result).await {
                summary.lock().await.urls_queued += 1;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_page(
        &self,
        job: &Job,
        mut result: JobResult,
        options: &OptionsSnapshot,
        api_keys: &HashMap<String, String>,
        model_defaults: &ModelDefaultsDoc,
        chain_config: &ChainConfig,
        throttle: &HostThrottle,
        cancellation: &CancellationToken,
        summary: &Arc<AsyncMutex<CrawlSummary>>,
    ) {
        if cancellation.is_cancelled() {
            self.fail_result(job, &result.url, ErrorCategory::Cancelled, "job was cancelled").await;
            summary.lock().await.pages_failed += 1;
            return;
        }

        let Ok(page_url) = Url::parse(&result.url) else {
            self.fail_result(job, &result.url, ErrorCategory::Unknown, "URL did not parse").await;
            summary.lock().await.pages_failed += 1;
            return;
        };
        let host = page_url.host_str().unwrap_or_default().to_string();
        throttle.wait_turn(&host, options.delay).await;

        let fetch_started = Instant::now();
        let html = match self.http.get(page_url.clone()).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(error) => {
                    self.fail_result(job, &result.url, ErrorCategory::Unknown, &error.to_string()).await;
                    summary.lock().await.pages_failed += 1;
                    return;
                }
            },
            Ok(response) => {
                self.fail_result(job, &result.url, ErrorCategory::Unknown, &format!("fetch returned {}", response.status())).await;
                summary.lock().await.pages_failed += 1;
                return;
            }
            Err(error) => {
                self.fail_result(job, &result.url, ErrorCategory::Unknown, &error.to_string()).await;
                summary.lock().await.pages_failed += 1;
                return;
            }
        };
        let fetch_duration_ms = fetch_started.elapsed().as_millis() as u64;

        let html = if let Some(signal) = protection::detect(&html) {
            match &self.protection_bypass {
                Some(bypass) => match bypass.solve(&result.url).await {
                    Some(bypassed_html) => bypassed_html,
                    None => {
                        self.metrics.crawl_page_skipped_protection();
                        self.fail_result(job, &result.url, ErrorCategory::Protection, &format!("{signal:?}")).await;
                        summary.lock().await.pages_failed += 1;
                        return;
                    }
                },
                None => {
                    self.metrics.crawl_page_skipped_protection();
                    self.fail_result(job, &result.url, ErrorCategory::Protection, &format!("{signal:?}")).await;
                    summary.lock().await.pages_failed += 1;
                    return;
                }
            }
        } else {
            html
        };
        self.metrics.crawl_page_fetched();

        let extract_started = Instant::now();
        let prompt = format!("Extract structured data from the following page content:\n\n{html}");
        let outcome = self.chain_runner.run(&job.chain_snapshot, &prompt, &job.schema, job.byok, api_keys, model_defaults, chain_config, cancellation).await;
        let extract_duration_ms = extract_started.elapsed().as_millis() as u64;

        result.fetch_duration_ms = Some(fetch_duration_ms);
        result.extract_duration_ms = Some(extract_duration_ms);
        result.retry_count = outcome.retry_count;
        result.token_in = outcome.token_in;
        result.token_out = outcome.token_out;
        result.provider = outcome.provider.clone();
        result.model = outcome.model.clone();
        result.completed_at = Some(Utc::now());

        if outcome.success {
            result.crawl_status = CrawlStatus::Completed;
            result.data = outcome.data.clone();

            let url = result.url.clone();
            let mutated = result.clone();
            let _ = self.repository.update_result(job.id.as_str(), &url, Box::new(move |r| *r = mutated)).await;

            {
                let mut guard = summary.lock().await;
                guard.pages_succeeded += 1;
                guard.token_in += outcome.token_in;
                guard.token_out += outcome.token_out;
                guard.last_provider = outcome.provider.clone();
                guard.last_model = outcome.model.clone();
                guard.last_generation_id = outcome.generation_id.clone();
                guard.total_fetch_duration_ms += fetch_duration_ms;
                guard.total_extract_duration_ms += extract_duration_ms;
                if let (Some(provider), Some(model)) = (&outcome.provider, &outcome.model) {
                    guard.usages.push(TokenUsage { provider: provider.clone(), model: model.clone(), token_in: outcome.token_in, token_out: outcome.token_out });
                }
            }

            let depth_ok = result.depth < options.max_depth;
            let pages_queued_ok = { summary.lock().await.urls_queued as usize } < options.max_pages;
            if depth_ok && pages_queued_ok {
                self.discover_children(job, &result, &html, &page_url, options, summary).await;
            }
        } else {
            result.crawl_status = CrawlStatus::Failed;
            result.error_category = outcome.error.as_ref().map(|e| e.category);
            result.error_message = outcome.error.as_ref().map(|e| e.user_message.clone());
            result.error_details = outcome.error.as_ref().map(|e| e.raw_message.clone());

            let url = result.url.clone();
            let mutated = result.clone();
            let _ = self.repository.update_result(job.id.as_str(), &url, Box::new(move |r| *r = mutated)).await;

            let mut guard = summary.lock().await;
            guard.pages_failed += 1;
            if guard.fatal_error.is_none() {
                if let Some(error) = &outcome.error {
                    if !error.should_fallback && !error.retryable {
                        guard.fatal_error = Some(error.clone());
                    }
                }
            }
        }
    }

    async fn discover_children(&self, job: &Job, parent: &JobResult, html: &str, base_url: &Url, options: &OptionsSnapshot, summary: &Arc<AsyncMutex<CrawlSummary>>) {
        let children = discovery::discover_links(html, base_url, options.follow_pattern.as_deref(), options.same_domain_only);

        for child_url in children {
            if { summary.lock().await.urls_queued as usize } >= options.max_pages {
                break;
            }
            let child = JobResult::new_pending(job.id.clone(), child_url, Some(parent.url.clone()), parent.depth + 1, 0, Utc::now());
            if let Ok(true) = self.repository.insert_result(child).await {
                summary.lock().await.urls_queued += 1;
            }
        }
    }

    async fn fail_result(&self, job: &Job, url: &str, category: ErrorCategory, message: &str) {
        let job_id = job.id.clone();
        let url = url.to_string();
        let message = message.to_string();
        let category_copy = category;
        let _ = self
            .repository
            .update_result(
                &job_id,
                &url,
                Box::new(move |r| {
                    r.crawl_status = CrawlStatus::Failed;
                    r.error_category = Some(category_copy);
                    r.error_message = Some(message.clone());
                    r.completed_at = Some(Utc::now());
                }),
            )
            .await;
    }
}

#[derive(Clone)]
struct OptionsSnapshot {
    max_depth: u32,
    max_pages: usize,
    same_domain_only: bool,
    follow_pattern: Option<String>,
    delay: Duration,
}

impl ResolvedOptions {
    fn snapshot(&self) -> OptionsSnapshot {
        OptionsSnapshot { max_depth: self.max_depth, max_pages: self.max_pages, same_domain_only: self.same_domain_only, follow_pattern: self.follow_pattern.clone(), delay: self.delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delay_variants() {
        assert_eq!(parse_delay("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_delay("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_delay("250"), Some(Duration::from_millis(250)));
    }

    fn sample_job(crawl_options: Option<crate::jobs::model::CrawlOptions>) -> Job {
        Job::new_pending(
            "job_1".to_string(),
            "user_1".to_string(),
            crate::jobs::model::JobKind::Crawl,
            "https://example.com".to_string(),
            serde_json::json!({}),
            crawl_options,
            vec![],
            "free".to_string(),
            false,
            false,
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_resolve_defaults_extract_from_seeds_to_false() {
        let job = sample_job(None);
        let options = ResolvedOptions::resolve(&job, &CrawlDefaults::default());
        assert!(!options.extract_from_seeds);
    }

    #[test]
    fn test_resolve_honors_explicit_extract_from_seeds() {
        let mut crawl_options: crate::jobs::model::CrawlOptions = serde_json::from_value(serde_json::json!({})).unwrap();
        crawl_options.extract_from_seeds = true;
        let job = sample_job(Some(crawl_options));
        let options = ResolvedOptions::resolve(&job, &CrawlDefaults::default());
        assert!(options.extract_from_seeds);
    }
}
