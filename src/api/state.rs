use std::sync::Arc;

use crate::accounting::AccountingLedger;
use crate::api::auth::Authenticator;
use crate::chain::ChainRunner;
use crate::config::{ApiLimits, ChainConfig, Config, CrawlDefaults, IdentityWebhookConfig, TierDefaults};
use crate::crawl::CrawlEngine;
use crate::dynamic_config::DynamicConfigRegistry;
use crate::jobs::repository::JobRepository;
use crate::observability::Metrics;
use crate::storage::StorageClient;
use crate::store::FjallStore;
use crate::webhook::WebhookDispatcher;
use crate::worker::idle::IdleMonitor;
use crate::worker::WorkerPool;

/// Shared handles every route needs, assembled once at boot by `cli::run`.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn JobRepository>,
    pub chain_runner: Arc<ChainRunner>,
    pub crawl_engine: Arc<CrawlEngine>,
    pub accounting: Arc<AccountingLedger>,
    pub dynamic_config: Arc<DynamicConfigRegistry>,
    pub webhook_dispatcher: Arc<WebhookDispatcher>,
    pub authenticator: Arc<dyn Authenticator>,
    pub store: Arc<FjallStore>,
    pub storage: Arc<StorageClient>,
    pub metrics: Arc<Metrics>,
    pub idle_monitor: Arc<IdleMonitor>,
    pub worker_pool: Arc<WorkerPool>,
    pub tiers: Arc<TierDefaults>,
    pub crawl_defaults: Arc<CrawlDefaults>,
    pub chain_config: Arc<ChainConfig>,
    pub api_limits: Arc<ApiLimits>,
    pub identity_webhook: Arc<IdentityWebhookConfig>,
}

#[allow(clippy::too_many_arguments)]
impl AppState {
    pub fn new(
        config: &Config,
        repository: Arc<dyn JobRepository>,
        chain_runner: Arc<ChainRunner>,
        crawl_engine: Arc<CrawlEngine>,
        accounting: Arc<AccountingLedger>,
        dynamic_config: Arc<DynamicConfigRegistry>,
        webhook_dispatcher: Arc<WebhookDispatcher>,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<FjallStore>,
        storage: Arc<StorageClient>,
        metrics: Arc<Metrics>,
        idle_monitor: Arc<IdleMonitor>,
        worker_pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            repository,
            chain_runner,
            crawl_engine,
            accounting,
            dynamic_config,
            webhook_dispatcher,
            authenticator,
            store,
            storage,
            metrics,
            idle_monitor,
            worker_pool,
            tiers: Arc::new(config.tiers.clone()),
            crawl_defaults: Arc::new(config.crawl.clone()),
            chain_config: Arc::new(config.chain.clone()),
            api_limits: Arc::new(config.server.api.clone()),
            identity_webhook: Arc::new(config.identity_webhook.clone()),
        }
    }
}
