//! End-to-end test of the job lifecycle: API-layer job creation is not
//! exercised here (see `tests/api_test.rs`) — this drives the worker pool
//! directly against a real `FjallJobRepository`, a mock page host and a
//! mock OpenAI-shaped LLM provider, and asserts the job reaches a terminal
//! state with results, token accounting and a usage insight recorded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use refyne_core::accounting::AccountingLedger;
use refyne_core::chain::ChainRunner;
use refyne_core::config::{ChainConfig, CrawlDefaults, DynamicConfigSettings, TierDefaults};
use refyne_core::crawl::CrawlEngine;
use refyne_core::dynamic_config::DynamicConfigRegistry;
use refyne_core::jobs::model::{ChainEntry, Job, JobKind, JobStatus};
use refyne_core::jobs::repository::{FjallJobRepository, JobRepository};
use refyne_core::llm::LlmExecutor;
use refyne_core::observability::Metrics;
use refyne_core::registry::{ApiConfig, AuthType, PricingCapabilities, ProviderEntry, ProviderRegistry, ProviderStatus, ResponseFormat};
use refyne_core::storage::StorageClient;
use refyne_core::store::FjallStore;
use refyne_core::webhook::WebhookDispatcher;
use refyne_core::worker::{ApiKeyResolver, StaticApiKeyResolver, WorkerPool};

async fn start_page_server(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

async fn start_llm_server(extracted: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    let response_body = json!({
        "id": "gen-e2e-1",
        "choices": [{"message": {"content": extracted.to_string()}}],
        "usage": {"prompt_tokens": 42, "completion_tokens": 7},
    });
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_extract_job_runs_end_to_end_through_worker_pool() {
    let temp = TempDir::new().expect("temp dir");
    let store = FjallStore::open(temp.path().join("store")).expect("open store");
    let storage = StorageClient::in_memory();
    let metrics = Arc::new(Metrics::new());

    let page_server = start_page_server("<html><body><h1>Hello world</h1></body></html>").await;
    let llm_server = start_llm_server(json!({"title": "Hello world"})).await;

    let repository: Arc<dyn JobRepository> = Arc::new(FjallJobRepository::new(store.clone()));
    let accounting = Arc::new(AccountingLedger::new(store.clone()));

    let provider_registry = Arc::new(ProviderRegistry::new(vec![ProviderEntry {
        name: "mock-provider".to_string(),
        display_name: "Mock Provider".to_string(),
        required_features: vec![],
        api_config: ApiConfig {
            base_url: llm_server.uri(),
            chat_endpoint: "/chat/completions".to_string(),
            auth_type: AuthType::Bearer,
            custom_auth_header: None,
            extra_headers: HashMap::new(),
            response_format: ResponseFormat::OpenAi,
            allow_base_url_override: false,
        },
        pricing: PricingCapabilities { supports_pricing: true },
        status: ProviderStatus::Active,
    }]));

    let llm_executor = Arc::new(LlmExecutor::new());
    let chain_runner = Arc::new(ChainRunner::new(llm_executor, provider_registry));
    let crawl_engine = Arc::new(CrawlEngine::new(chain_runner.clone(), repository.clone(), metrics.clone(), None));

    let dynamic_settings = DynamicConfigSettings { cache_ttl_secs: 300, error_backoff_secs: 60, prefix: "config".to_string() };
    let dynamic_config = Arc::new(DynamicConfigRegistry::new(storage.clone(), &dynamic_settings));

    let webhook_dispatcher = Arc::new(WebhookDispatcher::new(store.clone(), Default::default()));

    let mut keys = HashMap::new();
    keys.insert("mock-provider".to_string(), "test-key".to_string());
    let api_key_resolver: Arc<dyn ApiKeyResolver> = Arc::new(StaticApiKeyResolver::new(keys));

    let worker_pool = Arc::new(WorkerPool::new(
        repository.clone(),
        chain_runner,
        crawl_engine,
        accounting.clone(),
        dynamic_config,
        webhook_dispatcher,
        api_key_resolver,
        metrics,
        TierDefaults::default(),
        CrawlDefaults::default(),
        ChainConfig::default(),
        refyne_core::config::WebhookConfig::default(),
        1,
        20,
        5,
        3600,
        3600,
    ));

    let shutdown = CancellationToken::new();
    let pool_handle = worker_pool.clone();
    let shutdown_for_pool = shutdown.clone();
    let run_handle = tokio::spawn(async move { pool_handle.run(shutdown_for_pool).await });

    let job_id = Uuid::now_v7().to_string();
    let job = Job::new_pending(
        job_id.clone(),
        "user_e2e".to_string(),
        JobKind::Extract,
        format!("{}/article", page_server.uri()),
        json!({"type": "object", "properties": {"title": {"type": "string"}}}),
        None,
        vec![ChainEntry { provider: "mock-provider".to_string(), model: "mock-model".to_string(), temperature: None, max_tokens: None, strict_mode: None }],
        "free".to_string(),
        false,
        false,
        None,
        Utc::now(),
    );
    repository.create(job).await.expect("create job");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let completed = loop {
        let current = repository.get_by_id(&job_id).await.expect("get job").expect("job exists");
        if current.status == JobStatus::Completed || current.status == JobStatus::Failed {
            break current;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} did not reach a terminal state in time (last status {:?})", current.status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    shutdown.cancel();
    let _ = run_handle.await;

    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.token_in, 42);
    assert_eq!(completed.token_out, 7);
    assert_eq!(completed.last_provider.as_deref(), Some("mock-provider"));

    let results = repository.list_results(&job_id, 10, 0).await.expect("list results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].data.as_ref().and_then(|d| d.get("title")).and_then(|v| v.as_str()), Some("Hello world"));

    let insight = accounting.get_insight(&job_id).expect("insight lookup").expect("insight recorded");
    assert_eq!(insight.provider, "mock-provider");
    assert_eq!(insight.token_in, 42);
}
