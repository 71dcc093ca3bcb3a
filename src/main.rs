mod cli;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Commands};
use object_store::aws::AmazonS3Builder;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use refyne_core::accounting::AccountingLedger;
use refyne_core::api;
use refyne_core::api::auth::StoreAuthenticator;
use refyne_core::captcha::CaptchaClient;
use refyne_core::chain::ChainRunner;
use refyne_core::cleanup::CleanupScheduler;
use refyne_core::config::{Config, StorageConfig, StorageProvider};
use refyne_core::crawl::{CrawlEngine, ProtectionBypass};
use refyne_core::dynamic_config::DynamicConfigRegistry;
use refyne_core::jobs::repository::{FjallJobRepository, JobRepository};
use refyne_core::llm::LlmExecutor;
use refyne_core::observability::Metrics;
use refyne_core::registry::ProviderRegistry;
use refyne_core::storage::StorageClient;
use refyne_core::store::FjallStore;
use refyne_core::webhook::WebhookDispatcher;
use refyne_core::worker::idle::IdleMonitor;
use refyne_core::worker::{StaticApiKeyResolver, WorkerPool};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().map_err(|e| format!("failed to load config: {e}"))?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let store = Arc::new(FjallStore::open(&config.server.fjall_path)?);
    let storage = Arc::new(build_storage_client(&config.storage)?);
    let metrics = Arc::new(Metrics::new());

    let repository: Arc<dyn JobRepository> = Arc::new(FjallJobRepository::new((*store).clone()));
    let accounting = Arc::new(AccountingLedger::new((*store).clone()));

    let provider_registry = Arc::new(ProviderRegistry::bootstrap_default());
    let llm_executor = Arc::new(LlmExecutor::new());
    let chain_runner = Arc::new(ChainRunner::new(llm_executor, provider_registry));

    let protection_bypass: Option<Arc<dyn ProtectionBypass>> = if config.captcha.enabled() {
        Some(Arc::new(CaptchaClient::new(
            config.captcha.base_url.clone().expect("checked by enabled()"),
            config.captcha.shared_secret.clone().expect("checked by enabled()"),
            config.captcha.timeout_secs,
        )))
    } else {
        None
    };
    let crawl_engine = Arc::new(CrawlEngine::new(chain_runner.clone(), repository.clone(), metrics.clone(), protection_bypass));

    let dynamic_config = Arc::new(DynamicConfigRegistry::new((*storage).clone(), &config.dynamic_config));
    info!("priming dynamic config loaders");
    dynamic_config.load_all().await;

    let webhook_dispatcher = Arc::new(WebhookDispatcher::new((*store).clone(), config.webhook.clone()));
    let authenticator = Arc::new(StoreAuthenticator::new((*store).clone(), dynamic_config.clone()));

    // Platform-owned provider keys; BYOK jobs carry their own keys through
    // the API layer instead (spec §3 "BYOK", worker::ApiKeyResolver).
    let api_key_resolver = Arc::new(StaticApiKeyResolver::new(HashMap::new()));

    let worker_pool = Arc::new(WorkerPool::new(
        repository.clone(),
        chain_runner.clone(),
        crawl_engine.clone(),
        accounting.clone(),
        dynamic_config.clone(),
        webhook_dispatcher.clone(),
        api_key_resolver,
        metrics.clone(),
        config.tiers.clone(),
        config.crawl.clone(),
        config.chain.clone(),
        config.webhook.clone(),
        config.worker.num_workers,
        config.worker.poll_interval_ms,
        config.worker.shutdown_grace_period_secs,
        config.worker.stale_job_max_age_secs,
        config.worker.stale_check_interval_secs,
    ));

    let idle_monitor = Arc::new(IdleMonitor::new(config.idle.excluded_paths.clone(), config.idle.idle_timeout_secs));
    let cleanup_scheduler = Arc::new(CleanupScheduler::new(store.clone(), storage.clone(), config.retention.clone()));

    let mut background: JoinSet<()> = JoinSet::new();
    background.spawn(cleanup_scheduler.clone().run(shutdown.clone()));
    background.spawn(refresh_dynamic_config_loop(dynamic_config.clone(), config.dynamic_config.cache_ttl_secs, shutdown.clone()));
    background.spawn(worker_pool.clone().run(shutdown.clone()));

    match cli.command {
        Commands::Api(args) => {
            background.spawn(idle_monitor.clone().run(worker_pool.clone(), shutdown.clone()));

            let state = api::state::AppState::new(
                &config,
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
            );

            let address = args.address.unwrap_or(config.server.bind_addr);
            api::run(address, state, shutdown.clone()).await?;
        }
        Commands::Worker => {
            shutdown.cancelled().await;
        }
    }

    while background.join_next().await.is_some() {}
    info!("shutdown complete");
    Ok(())
}

/// Builds the object store backend from `StorageConfig` (spec §4.B): `Local`
/// runs against an in-memory store for single-node/dev deployments, `S3`
/// against a real bucket via the credentials and endpoint the operator
/// supplies.
fn build_storage_client(config: &StorageConfig) -> Result<StorageClient, AnyError> {
    match config.provider {
        StorageProvider::Local => Ok(StorageClient::in_memory()),
        StorageProvider::S3 => {
            let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);
            if let Some(endpoint) = &config.endpoint {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }
            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            if let Some(access_key) = &config.access_key {
                builder = builder.with_access_key_id(access_key);
            }
            if let Some(secret_key) = &config.secret_key {
                builder = builder.with_secret_access_key(secret_key);
            }
            let store = builder.build()?;
            Ok(StorageClient::new(Arc::new(store), config.bucket.clone()))
        }
    }
}

/// Ticks the dynamic config refresh sweep on the configured cache TTL (spec
/// §4.B `MaybeRefreshAll`), same tick/cancel shape as every other long-lived
/// task in the process.
async fn refresh_dynamic_config_loop(registry: Arc<DynamicConfigRegistry>, cache_ttl_secs: u64, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(cache_ttl_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        registry.maybe_refresh_all().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
