//! Cleanup scheduler (spec §4.L): periodic deletion of expired job results
//! and debug captures.
//!
//! Grounded on the worker pool's `stale_reaper_loop` for the tick/cancel
//! shape, and on `store::pruning`'s own deferral comment for the split
//! between store-side pruning (fjall) and S3-side debug-capture reap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;
use crate::storage::StorageClient;
use crate::store::pruning::PruneStats;
use crate::store::FjallStore;

const DEBUG_CAPTURE_PREFIX: &str = "debug/";

/// Deletes every object under `debug/` whose `last_modified` is older than
/// `ttl_days`. Debug captures are written as flat, non-recursive keys
/// (`debug/{job_id}/{hash}.html`), so a single non-recursive listing per job
/// prefix is enough; there's no nested structure to walk.
pub async fn reap_debug_captures(storage: &StorageClient, ttl_days: u32) -> crate::storage::Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(ttl_days as i64);
    let objects = storage.list_prefix(DEBUG_CAPTURE_PREFIX).await?;

    let mut reaped = 0;
    for object in objects {
        if object.last_modified < cutoff {
            storage.delete(&object.key).await?;
            reaped += 1;
        }
    }
    Ok(reaped)
}

/// Drives both retention mechanisms (fjall job/result pruning, S3 debug
/// capture reap) on `cleanup_interval_secs`, under one cancellation token
/// per spec §9's "all long-lived tasks governed by one root context".
pub struct CleanupScheduler {
    store: Arc<FjallStore>,
    storage: Arc<StorageClient>,
    retention: RetentionConfig,
}

impl CleanupScheduler {
    pub fn new(store: Arc<FjallStore>, storage: Arc<StorageClient>, retention: RetentionConfig) -> Self {
        Self { store, storage, retention }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.retention.cleanup_interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("cleanup scheduler shutting down");
                    return;
                }
            }

            self.run_once().await;
        }
    }

    async fn run_once(&self) {
        match self.store.prune_expired(self.retention.job_ttl_days, self.retention.debug_capture_ttl_days) {
            Ok(PruneStats { jobs_pruned, job_results_pruned, idempotency_pruned }) => {
                tracing::info!(jobs_pruned, job_results_pruned, idempotency_pruned, "pruned expired store entries");
            }
            Err(error) => tracing::warn!(%error, "store pruning failed"),
        }

        match reap_debug_captures(&self.storage, self.retention.debug_capture_ttl_days).await {
            Ok(reaped) => {
                if reaped > 0 {
                    tracing::info!(reaped, "reaped expired debug captures");
                }
            }
            Err(error) => tracing::warn!(%error, "debug capture reap failed"),
        }
    }
}
