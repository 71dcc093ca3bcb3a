//! Route handlers (spec §6): job creation, status, results, health.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use super::auth::Identity;
use super::models::{
    CreateJobRequest, HealthResponse, JobAcceptedResponse, JobResultView, JobResultsPage, JobView,
    OperatorHealthResponse, PageQuery,
};
use super::state::AppState;
use crate::api::error::ApiError;
use crate::config::TierLimits;
use crate::jobs::model::{Job, JobKind, JobStatus};

const MAX_CONCURRENT_JOBS_CHECK: bool = true;

/// Authenticates the request's `Authorization: Bearer <token>` header, touches
/// the idle monitor, and enforces the caller's tier concurrency cap.
async fn authenticate(state: &AppState, headers: &HeaderMap, path: &str) -> Result<Identity, ApiError> {
    state.idle_monitor.touch(path);

    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    state.authenticator.verify(bearer).await.ok_or(ApiError::Unauthorized)
}

async fn enforce_concurrency_cap(state: &AppState, identity: &Identity) -> Result<(), ApiError> {
    if !MAX_CONCURRENT_JOBS_CHECK {
        return Ok(());
    }
    let cap = state.tiers.get(&identity.tier).concurrency_cap as usize;
    let running = state.repository.count_concurrent_running(&identity.user_id).await?;
    if running >= cap {
        return Err(ApiError::ConcurrencyCapExceeded { cap });
    }
    Ok(())
}

async fn create_job(
    state: &AppState,
    identity: Identity,
    kind: JobKind,
    request: CreateJobRequest,
) -> Result<Job, ApiError> {
    enforce_concurrency_cap(state, &identity).await?;

    let tier_limits = state.tiers.get(&identity.tier);
    let byok = request.byok_keys.as_ref().is_some_and(|keys| !keys.is_empty());

    enforce_tier_quota(state, &identity, &tier_limits)?;
    enforce_tier_features(&identity, &tier_limits, kind, byok, request.capture_debug, request.webhook_url.as_deref())?;

    let idempotency_key = request.idempotency_key.as_deref().map(|key| format!("{}:{key}", identity.user_id));
    if let Some(scoped_key) = &idempotency_key {
        if let Some(existing_job_id) = state.store.get_idempotent(scoped_key)? {
            if let Some(existing) = state.repository.get_by_id(&existing_job_id).await? {
                return Ok(existing);
            }
        }
    }

    let job_id = Uuid::now_v7().to_string();
    let now = Utc::now();
    let job = Job::new_pending(
        job_id,
        identity.user_id.clone(),
        kind,
        request.url,
        request.schema,
        request.crawl_options,
        request.chain,
        identity.tier.clone(),
        byok,
        request.capture_debug,
        request.webhook_url,
        now,
    );

    state.repository.create(job.clone()).await?;
    if let Some(scoped_key) = &idempotency_key {
        state.store.remember_idempotency(scoped_key, &job.id)?;
    }
    state.metrics.job_accepted();
    Ok(job)
}

/// Rejects job creation once the caller's current-month spend has already
/// reached the tier's `monthly_quota_usd` (spec §4.D).
fn enforce_tier_quota(state: &AppState, identity: &Identity, tier_limits: &TierLimits) -> Result<(), ApiError> {
    let spent = state.accounting.monthly_spend(&identity.user_id, Utc::now())?;
    if spent >= tier_limits.monthly_quota_usd {
        return Err(ApiError::TierQuotaExceeded { spent_usd: spent, quota_usd: tier_limits.monthly_quota_usd });
    }
    Ok(())
}

/// Derives the features a job requires from its own shape and checks each
/// against the caller's identity scopes or the tier's `allowed_features` —
/// either source grants access (spec §4.B/§4.D).
fn enforce_tier_features(
    identity: &Identity,
    tier_limits: &TierLimits,
    kind: JobKind,
    byok: bool,
    capture_debug: bool,
    webhook_url: Option<&str>,
) -> Result<(), ApiError> {
    let mut required = Vec::new();
    if kind == JobKind::Crawl {
        required.push("crawl");
    }
    if byok {
        required.push("byok");
    }
    if webhook_url.is_some() {
        required.push("webhooks");
    }
    if capture_debug {
        required.push("debug_capture");
    }

    for feature in required {
        let granted = identity.features.iter().any(|f| f == feature) || tier_limits.allowed_features.iter().any(|f| f == feature);
        if !granted {
            return Err(ApiError::TierFeatureRequired { feature: feature.to_string() });
        }
    }
    Ok(())
}

/// `POST /extract`: a single-page extraction (spec §6 "one URL, one schema").
pub async fn extract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers, "/extract").await?;
    let job = create_job(&state, identity, JobKind::Extract, request).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAcceptedResponse { job_id: job.id, status: job.status })))
}

/// `POST /crawl`: a multi-page crawl seeded from one URL (spec §6).
pub async fn crawl(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers, "/crawl").await?;
    let job = create_job(&state, identity, JobKind::Crawl, request).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAcceptedResponse { job_id: job.id, status: job.status })))
}

/// `GET /jobs/{id}`: current job status/snapshot.
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers, "/jobs").await?;

    let job = state
        .repository
        .get_by_id(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    if job.user_id != identity.user_id {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }

    Ok(Json(JobView::from(job)))
}

/// `GET /jobs/{id}/results`: paginated per-URL results for a job.
pub async fn get_job_results(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers, "/jobs").await?;

    let job = state
        .repository
        .get_by_id(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;
    if job.user_id != identity.user_id {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }

    let results = state.repository.list_results(&job_id, page.limit, page.offset).await?;
    let views: Vec<JobResultView> = results.into_iter().map(|r| JobResultView::from_result(r, job.byok)).collect();

    if wants_ndjson(&headers) {
        let mut body = String::new();
        for view in &views {
            if let Ok(line) = serde_json::to_string(view) {
                body.push_str(&line);
                body.push('\n');
            }
        }
        return Ok((
            [(axum::http::header::CONTENT_TYPE, "application/x-ndjson")],
            body,
        )
            .into_response());
    }

    Ok(Json(JobResultsPage { results: views, limit: page.limit, offset: page.offset }).into_response())
}

/// `Accept: application/x-ndjson` (or `application/ndjson`) opts into the
/// newline-delimited representation of `/jobs/{id}/results` (spec §6
/// "content-type negotiable (JSON / NDJSON)"). Anything else stays JSON.
fn wants_ndjson(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("ndjson"))
}

/// One tick's worth of SSE events, built from a fresh read of the job row
/// plus every result not yet seen on a prior tick.
async fn poll_job_events(
    repository: &std::sync::Arc<dyn crate::jobs::repository::JobRepository>,
    job_id: &str,
    byok: bool,
    seen: &mut std::collections::HashSet<String>,
) -> Option<(Vec<axum::response::sse::Event>, bool)> {
    let current = repository.get_by_id(job_id).await.ok()??;
    let results = repository.list_results(job_id, 10_000, 0).await.ok()?;

    let mut events = Vec::new();
    let completed = results
        .iter()
        .filter(|r| r.crawl_status != crate::jobs::model::CrawlStatus::Pending && r.crawl_status != crate::jobs::model::CrawlStatus::Crawling)
        .count();
    let progress = serde_json::json!({ "urls_queued": current.urls_queued, "urls_completed": completed });
    if let Ok(data) = serde_json::to_string(&progress) {
        events.push(axum::response::sse::Event::default().event("progress").data(data));
    }

    for result in &results {
        if result.crawl_status == crate::jobs::model::CrawlStatus::Pending || result.crawl_status == crate::jobs::model::CrawlStatus::Crawling {
            continue;
        }
        if seen.insert(result.url.clone()) {
            let view = JobResultView::from_result(result.clone(), byok);
            if let Ok(data) = serde_json::to_string(&view) {
                events.push(axum::response::sse::Event::default().event("result").data(data));
            }
        }
    }

    let done = current.status != JobStatus::Pending && current.status != JobStatus::Running;
    if done {
        let view = JobView::from(current);
        if let Ok(data) = serde_json::to_string(&view) {
            events.push(axum::response::sse::Event::default().event("status").data(data));
        }
    }

    Some((events, done))
}

/// `GET /jobs/{id}/stream`: Server-Sent Events (spec §6). Emits `progress`
/// after every poll, one `result` event per newly-completed JobResult, and a
/// terminal `status` event once the job leaves `running`/`pending`.
pub async fn stream_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers, "/jobs").await?;

    let job = state
        .repository
        .get_by_id(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;
    if job.user_id != identity.user_id {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }

    let repository = state.repository.clone();
    let byok = job.byok;
    let seen = std::sync::Arc::new(tokio::sync::Mutex::new(std::collections::HashSet::new()));
    let finished = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

    let ticks = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(std::time::Duration::from_secs(1)));
    let stream = ticks
        .take_while({
            let finished = finished.clone();
            move |_| std::future::ready(!finished.load(std::sync::atomic::Ordering::Relaxed))
        })
        .then(move |_| {
            let repository = repository.clone();
            let job_id = job_id.clone();
            let seen = seen.clone();
            let finished = finished.clone();
            async move {
                let mut seen_guard = seen.lock().await;
                match poll_job_events(&repository, &job_id, byok, &mut seen_guard).await {
                    Some((events, done)) => {
                        if done {
                            finished.store(true, std::sync::atomic::Ordering::Relaxed);
                        }
                        events
                    }
                    None => {
                        finished.store(true, std::sync::atomic::Ordering::Relaxed);
                        Vec::new()
                    }
                }
            }
        })
        .map(futures::stream::iter)
        .flatten()
        .map(Ok::<_, std::convert::Infallible>);

    Ok(axum::response::Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()))
}

/// `GET /jobs/{id}/download`: bundles every JobResult into a single NDJSON
/// archive (spec §6 "bundled results archive"), one JSON object per line so
/// very large crawls stream without buffering the whole job in memory twice.
pub async fn download_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers, "/jobs").await?;

    let job = state
        .repository
        .get_by_id(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;
    if job.user_id != identity.user_id {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }

    let mut body = String::new();
    let mut offset = 0usize;
    const PAGE: usize = 500;
    loop {
        let batch = state.repository.list_results(&job_id, PAGE, offset).await?;
        if batch.is_empty() {
            break;
        }
        let len = batch.len();
        for result in batch {
            let view = JobResultView::from_result(result, job.byok);
            if let Ok(line) = serde_json::to_string(&view) {
                body.push_str(&line);
                body.push('\n');
            }
        }
        if len < PAGE {
            break;
        }
        offset += PAGE;
    }

    let filename = format!("attachment; filename=\"{job_id}-results.ndjson\"");
    Ok((
        [
            (axum::http::header::CONTENT_TYPE, "application/x-ndjson".to_string()),
            (axum::http::header::CONTENT_DISPOSITION, filename),
        ],
        body,
    ))
}

/// `POST /webhooks/clerk`: external-IdP lifecycle webhook (spec §6).
/// Svix-style signature verified against the raw body before any JSON
/// parsing, then applied as a balance credit and/or tier change.
pub async fn clerk_webhook(State(state): State<AppState>, headers: HeaderMap, body: bytes::Bytes) -> Result<impl IntoResponse, ApiError> {
    let secret = state.identity_webhook.signing_secret.as_deref().ok_or_else(|| ApiError::Internal("identity webhook not configured".into()))?;

    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    let clerk_headers = crate::api::clerk::ClerkHeaders {
        svix_id: header_str("svix-id").ok_or(ApiError::Unauthorized)?,
        svix_timestamp: header_str("svix-timestamp").ok_or(ApiError::Unauthorized)?,
        svix_signature: header_str("svix-signature").ok_or(ApiError::Unauthorized)?,
    };

    let now = chrono::Utc::now().timestamp();
    if !crate::api::clerk::verify(secret, &clerk_headers, &body, now, state.identity_webhook.tolerance_secs) {
        return Err(ApiError::Unauthorized);
    }

    let event: crate::api::clerk::ClerkEvent = serde_json::from_slice(&body)?;

    if let Some(tier) = &event.data.tier {
        state.accounting.set_user_tier(&event.data.user_id, tier)?;
    }
    if let Some(amount) = event.data.amount_usd {
        let kind = if event.event_type.starts_with("subscription") {
            crate::jobs::model::TransactionType::Subscription
        } else {
            crate::jobs::model::TransactionType::Topup
        };
        state.accounting.credit_balance(&event.data.user_id, amount, kind, event.data.external_payment_id.as_deref(), &event.event_type)?;
    }

    Ok(StatusCode::OK)
}

/// `GET /health`: liveness probe, never touches the idle clock (spec §4.M
/// excludes health endpoints from idle tracking).
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

/// `GET /operators/health`: liveness plus process-wide metrics (spec §6).
pub async fn operator_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(OperatorHealthResponse {
        status: "healthy",
        metrics: state.metrics.snapshot(),
        active_jobs: state.worker_pool.active_jobs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_roundtrips_through_status() {
        assert_eq!(JobStatus::Pending.is_terminal(), false);
    }

    fn identity(features: &[&str]) -> Identity {
        Identity { user_id: "user_1".to_string(), tier: "free".to_string(), features: features.iter().map(|f| f.to_string()).collect() }
    }

    #[test]
    fn test_enforce_tier_features_rejects_crawl_without_feature() {
        let result = enforce_tier_features(&identity(&[]), &crate::config::TierDefaults::fallback(), JobKind::Crawl, false, false, None);
        assert!(matches!(result, Err(ApiError::TierFeatureRequired { feature }) if feature == "crawl"));
    }

    #[test]
    fn test_enforce_tier_features_allows_crawl_via_identity_scope() {
        let result = enforce_tier_features(&identity(&["crawl"]), &crate::config::TierDefaults::fallback(), JobKind::Crawl, false, false, None);
        assert!(result.is_ok());
    }

    #[test]
    fn test_enforce_tier_features_allows_byok_via_tier_allowed_features() {
        let tier_limits = TierLimits { allowed_features: vec!["byok".to_string()], ..crate::config::TierDefaults::fallback() };
        let result = enforce_tier_features(&identity(&[]), &tier_limits, JobKind::Extract, true, false, None);
        assert!(result.is_ok());
    }

    #[test]
    fn test_enforce_tier_features_rejects_webhook_without_feature() {
        let result = enforce_tier_features(&identity(&[]), &crate::config::TierDefaults::fallback(), JobKind::Extract, false, false, Some("https://example.com/hook"));
        assert!(matches!(result, Err(ApiError::TierFeatureRequired { feature }) if feature == "webhooks"));
    }
}
