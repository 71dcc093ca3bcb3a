//! HTTP surface integration tests (spec §6): auth, job creation, status,
//! results, clerk identity webhook. Exercises the real router via
//! `tower::ServiceExt::oneshot` against an in-memory/temp-dir stack, the
//! same pattern the unit tests in `api::auth` use for a single component.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tower::ServiceExt;

use refyne_core::accounting::AccountingLedger;
use refyne_core::api::auth::StoreAuthenticator;
use refyne_core::api::router;
use refyne_core::api::state::AppState;
use refyne_core::chain::ChainRunner;
use refyne_core::config::{Config, DynamicConfigSettings, IdentityWebhookConfig};
use refyne_core::crawl::CrawlEngine;
use refyne_core::dynamic_config::DynamicConfigRegistry;
use refyne_core::jobs::model::ApiKey;
use refyne_core::jobs::repository::{FjallJobRepository, JobRepository};
use refyne_core::llm::LlmExecutor;
use refyne_core::observability::Metrics;
use refyne_core::registry::ProviderRegistry;
use refyne_core::storage::StorageClient;
use refyne_core::store::partitions::encode_api_key_key;
use refyne_core::store::FjallStore;
use refyne_core::webhook::WebhookDispatcher;
use refyne_core::worker::idle::IdleMonitor;
use refyne_core::worker::{StaticApiKeyResolver, WorkerPool};

fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    use std::fmt::Write;
    bytes.as_ref().iter().fold(String::new(), |mut acc, byte| {
        let _ = write!(acc, "{byte:02x}");
        acc
    })
}

fn hash_secret(secret: &str) -> String {
    hex_encode(Sha256::digest(secret.as_bytes()))
}

fn test_config() -> Config {
    let mut config: Config = toml::from_str("").expect("Config fields all carry serde defaults");
    config.identity_webhook = IdentityWebhookConfig { signing_secret: Some("whsec_dGVzdHNlY3JldA==".to_string()), tolerance_secs: 300 };
    config
}

/// Assembles the same graph `main.rs` does, wired against a temp-dir store
/// and in-memory object store instead of real infrastructure.
struct TestApp {
    router: axum::Router,
    store: FjallStore,
    _temp: TempDir,
}

async fn build_test_app() -> TestApp {
    let temp = TempDir::new().expect("temp dir");
    let store = FjallStore::open(temp.path().join("store")).expect("open fjall store");
    let storage = Arc::new(StorageClient::in_memory());
    let metrics = Arc::new(Metrics::new());

    let repository: Arc<dyn JobRepository> = Arc::new(FjallJobRepository::new(store.clone()));
    let accounting = Arc::new(AccountingLedger::new(store.clone()));

    let provider_registry = Arc::new(ProviderRegistry::bootstrap_default());
    let llm_executor = Arc::new(LlmExecutor::new());
    let chain_runner = Arc::new(ChainRunner::new(llm_executor, provider_registry));
    let crawl_engine = Arc::new(CrawlEngine::new(chain_runner.clone(), repository.clone(), metrics.clone(), None));

    let dynamic_settings = DynamicConfigSettings { cache_ttl_secs: 300, error_backoff_secs: 60, prefix: "config".to_string() };
    let dynamic_config = Arc::new(DynamicConfigRegistry::new((*storage).clone(), &dynamic_settings));

    let webhook_dispatcher = Arc::new(WebhookDispatcher::new(store.clone(), Default::default()));
    let authenticator = Arc::new(StoreAuthenticator::new(store.clone(), dynamic_config.clone()));

    let api_key_resolver = Arc::new(StaticApiKeyResolver::new(Default::default()));
    let worker_pool = Arc::new(WorkerPool::new(
        repository.clone(),
        chain_runner.clone(),
        crawl_engine.clone(),
        accounting.clone(),
        dynamic_config.clone(),
        webhook_dispatcher.clone(),
        api_key_resolver,
        metrics.clone(),
        Default::default(),
        Default::default(),
        Default::default(),
        Default::default(),
        1,
        50,
        5,
        3600,
        60,
    ));
    let idle_monitor = Arc::new(IdleMonitor::new(Vec::new(), 900));

    let config = test_config();

    let state = AppState::new(
        &config,
        repository,
        chain_runner,
        crawl_engine,
        accounting,
        dynamic_config,
        webhook_dispatcher,
        authenticator,
        Arc::new(store.clone()),
        storage,
        metrics,
        idle_monitor,
        worker_pool,
    );

    TestApp { router: router(state), store, _temp: temp }
}

impl TestApp {
    fn issue_api_key(&self, user_id: &str, tier: &str) -> String {
        let bearer = format!("rf_test_{user_id}");
        let key = ApiKey {
            id: format!("key_{user_id}"),
            user_id: user_id.to_string(),
            name: "test".into(),
            key_hash: hash_secret(&bearer),
            key_prefix: "rf_test".into(),
            tier: tier.to_string(),
            scopes: vec!["extract".into(), "crawl".into()],
            last_used_at: None,
            expires_at: None,
            created_at: Utc::now(),
            revoked_at: None,
        };
        self.store.put_json(&self.store.api_keys, encode_api_key_key(&key.key_hash), &key).unwrap();
        bearer
    }
}

fn extract_request(bearer: &str, url: &str) -> Request<Body> {
    extract_request_with_body(bearer, json!({
        "url": url,
        "schema": {"type": "object", "properties": {"title": {"type": "string"}}},
    }))
}

fn extract_request_with_body(bearer: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .uri("/extract")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_app().await;
    let request = Request::builder().uri("/health").method("GET").body(Body::empty()).unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.get("status").and_then(|v| v.as_str()), Some("healthy"));
}

#[tokio::test]
async fn test_extract_requires_bearer_token() {
    let app = build_test_app().await;
    let request = Request::builder()
        .uri("/extract")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&json!({"url": "https://example.com", "schema": {}})).unwrap()))
        .unwrap();

    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_extract_accepts_job_and_get_job_returns_it() {
    let app = build_test_app().await;
    let bearer = app.issue_api_key("user_1", "free");

    let response = app.router.clone().oneshot(extract_request(&bearer, "https://example.com/article")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let accepted: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let job_id = accepted.get("job_id").and_then(|v| v.as_str()).unwrap().to_string();
    assert!(!job_id.is_empty());

    let get_request = Request::builder()
        .uri(format!("/jobs/{job_id}"))
        .method("GET")
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Body::empty())
        .unwrap();
    let get_response = app.router.oneshot(get_request).await.unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);

    let get_body = axum::body::to_bytes(get_response.into_body(), usize::MAX).await.unwrap();
    let job: serde_json::Value = serde_json::from_slice(&get_body).unwrap();
    assert_eq!(job.get("id").and_then(|v| v.as_str()), Some(job_id.as_str()));
    assert_eq!(job.get("status").and_then(|v| v.as_str()), Some("pending"));
    // error_details stays hidden for non-BYOK callers (spec §6).
    assert!(job.get("error_details").unwrap().is_null());
}

#[tokio::test]
async fn test_get_job_not_found() {
    let app = build_test_app().await;
    let bearer = app.issue_api_key("user_1", "free");

    let request = Request::builder()
        .uri("/jobs/does-not-exist")
        .method("GET")
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_job_rejects_cross_user_access() {
    let app = build_test_app().await;
    let owner_bearer = app.issue_api_key("owner", "free");
    let other_bearer = app.issue_api_key("intruder", "free");

    let response = app.router.clone().oneshot(extract_request(&owner_bearer, "https://example.com")).await.unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let job_id = serde_json::from_slice::<serde_json::Value>(&body).unwrap()["job_id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/jobs/{job_id}"))
        .method("GET")
        .header(header::AUTHORIZATION, format!("Bearer {other_bearer}"))
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_free_tier_concurrency_cap_rejects_second_job() {
    let app = build_test_app().await;
    let bearer = app.issue_api_key("user_1", "free");

    let first = app.router.clone().oneshot(extract_request(&bearer, "https://example.com/one")).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    // free tier's concurrency_cap defaults to 1 (config::TierDefaults::default).
    let second = app.router.clone().oneshot(extract_request(&bearer, "https://example.com/two")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_job_results_ndjson_content_negotiation() {
    let app = build_test_app().await;
    let bearer = app.issue_api_key("user_1", "free");

    let response = app.router.clone().oneshot(extract_request(&bearer, "https://example.com")).await.unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let job_id = serde_json::from_slice::<serde_json::Value>(&body).unwrap()["job_id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/jobs/{job_id}/results"))
        .method("GET")
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .header(header::ACCEPT, "application/x-ndjson")
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()), Some("application/x-ndjson"));
}

#[tokio::test]
async fn test_clerk_webhook_rejects_unsigned_request() {
    let app = build_test_app().await;
    let request = Request::builder()
        .uri("/webhooks/clerk")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&json!({"type": "subscription.created", "data": {"user_id": "user_1"}})).unwrap()))
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_clerk_webhook_updates_tier_on_valid_signature() {
    use base64::Engine;
    use hmac::{Hmac, Mac};

    let app = build_test_app().await;
    let secret = "whsec_dGVzdHNlY3JldA==";
    let secret_bytes = base64::engine::general_purpose::STANDARD.decode(secret.strip_prefix("whsec_").unwrap()).unwrap();

    let payload = json!({"type": "subscription.updated", "data": {"user_id": "user_42", "tier": "pro"}});
    let body_bytes = serde_json::to_vec(&payload).unwrap();
    let svix_id = "msg_1";
    let timestamp = Utc::now().timestamp().to_string();
    let signed_content = format!("{svix_id}.{timestamp}.{}", String::from_utf8_lossy(&body_bytes));

    let mut mac = Hmac::<Sha256>::new_from_slice(&secret_bytes).unwrap();
    mac.update(signed_content.as_bytes());
    let signature = format!("v1,{}", base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()));

    let request = Request::builder()
        .uri("/webhooks/clerk")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .header("svix-id", svix_id)
        .header("svix-timestamp", timestamp)
        .header("svix-signature", signature)
        .body(Body::from(body_bytes))
        .unwrap();

    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let tier = AccountingLedger::new(app.store.clone()).get_user_tier("user_42").unwrap();
    assert_eq!(tier.as_deref(), Some("pro"));
}

#[tokio::test]
async fn test_idempotency_key_returns_same_job_on_repeat() {
    let app = build_test_app().await;
    let bearer = app.issue_api_key("user_1", "free");

    let body = json!({
        "url": "https://example.com/article",
        "schema": {"type": "object", "properties": {"title": {"type": "string"}}},
        "idempotency_key": "order-123",
    });

    let first = app.router.clone().oneshot(extract_request_with_body(&bearer, body.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let first_body = axum::body::to_bytes(first.into_body(), usize::MAX).await.unwrap();
    let first_job_id = serde_json::from_slice::<serde_json::Value>(&first_body).unwrap()["job_id"].as_str().unwrap().to_string();

    // The free tier's concurrency cap is 1, so a genuinely new job here would
    // be rejected with 429 — a 202 with the same job id proves the repeat was
    // served from the idempotency record rather than creating a second job.
    let second = app.router.clone().oneshot(extract_request_with_body(&bearer, body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    let second_body = axum::body::to_bytes(second.into_body(), usize::MAX).await.unwrap();
    let second_job_id = serde_json::from_slice::<serde_json::Value>(&second_body).unwrap()["job_id"].as_str().unwrap().to_string();

    assert_eq!(first_job_id, second_job_id);
}

#[tokio::test]
async fn test_idempotency_key_is_scoped_per_user() {
    let app = build_test_app().await;
    let owner_bearer = app.issue_api_key("owner", "free");
    let other_bearer = app.issue_api_key("intruder", "free");

    let body = json!({
        "url": "https://example.com/article",
        "schema": {"type": "object", "properties": {"title": {"type": "string"}}},
        "idempotency_key": "shared-key",
    });

    let first = app.router.clone().oneshot(extract_request_with_body(&owner_bearer, body.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let first_body = axum::body::to_bytes(first.into_body(), usize::MAX).await.unwrap();
    let first_job_id = serde_json::from_slice::<serde_json::Value>(&first_body).unwrap()["job_id"].as_str().unwrap().to_string();

    let second = app.router.clone().oneshot(extract_request_with_body(&other_bearer, body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    let second_body = axum::body::to_bytes(second.into_body(), usize::MAX).await.unwrap();
    let second_job_id = serde_json::from_slice::<serde_json::Value>(&second_body).unwrap()["job_id"].as_str().unwrap().to_string();

    assert_ne!(first_job_id, second_job_id);
}

#[tokio::test]
async fn test_byok_request_rejected_without_byok_feature() {
    let app = build_test_app().await;
    let bearer = app.issue_api_key("user_1", "free");

    let body = json!({
        "url": "https://example.com/article",
        "schema": {"type": "object", "properties": {"title": {"type": "string"}}},
        "byok_keys": {"openrouter": "sk-test"},
    });

    let response = app.router.clone().oneshot(extract_request_with_body(&bearer, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response_body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&response_body).unwrap();
    assert_eq!(parsed.get("code").and_then(|v| v.as_str()), Some("TIER_FEATURE_REQUIRED"));
    assert_eq!(parsed.get("category").and_then(|v| v.as_str()), Some("tier_feature"));
}

#[tokio::test]
async fn test_monthly_quota_exceeded_rejects_job() {
    let app = build_test_app().await;
    let bearer = app.issue_api_key("user_1", "free");

    // Free tier's monthly_quota_usd defaults to 1.0 (config::TierDefaults::default);
    // record spend already at the cap so the next job creation is rejected.
    let accounting = AccountingLedger::new(app.store.clone());
    accounting.credit_balance("user_1", 10.0, refyne_core::jobs::model::TransactionType::Topup, None, "seed balance").unwrap();
    accounting
        .finalize_job(
            "job_prior",
            "user_1",
            refyne_core::jobs::model::JobKind::Extract,
            refyne_core::jobs::model::JobStatus::Completed,
            1.0,
            false,
            0.0,
            refyne_core::accounting::InsightInput::default(),
        )
        .unwrap();

    let response = app.router.clone().oneshot(extract_request(&bearer, "https://example.com")).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.get("code").and_then(|v| v.as_str()), Some("TIER_QUOTA_EXCEEDED"));
    assert_eq!(parsed.get("category").and_then(|v| v.as_str()), Some("tier_quota"));
}
