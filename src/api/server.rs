use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::{Router, routing::get, routing::post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::info;

use super::{
    services::{clerk_webhook, crawl, download_job, extract, get_job, get_job_results, health, operator_health, stream_job},
    state::AppState,
};

/// Builds the router; kept separate from `run` so tests can mount it against
/// `tower::ServiceExt::oneshot` without binding a socket.
pub fn router(state: AppState) -> Router {
    let max_payload_bytes = state.api_limits.max_payload_bytes.as_u64() as usize;

    Router::new()
        .route("/extract", post(extract))
        .route("/crawl", post(crawl))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/results", get(get_job_results))
        .route("/jobs/{job_id}/stream", get(stream_job))
        .route("/jobs/{job_id}/download", get(download_job))
        .route("/webhooks/clerk", post(clerk_webhook))
        .route("/health", get(health))
        .route("/operators/health", get(operator_health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .layer(RequestDecompressionLayer::new())
}

/// Serves the router until `shutdown` is cancelled, giving axum's own
/// graceful-shutdown machinery the same cancellation token every other
/// long-lived task in the process uses (spec §9 "one root context").
pub async fn run(address: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<(), std::io::Error> {
    let app = router(state);
    let listener = TcpListener::bind(address).await?;
    info!(%address, "refyne-core API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
