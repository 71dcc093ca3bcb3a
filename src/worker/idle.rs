//! Idle monitor (spec §4.M): tracks the last non-excluded request and emits
//! a shutdown signal once the server has been idle past a threshold with
//! zero active jobs.
//!
//! Grounded on the worker pool's own shutdown-signal shape (a shared
//! `CancellationToken`), generalized from "observe shutdown" to "trigger
//! it" once `BackgroundWorkCheck()` is false.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::WorkerPool;

/// Shared last-request clock, updated by request middleware and polled by
/// [`IdleMonitor::run`]. Excluded paths (health, liveness, readiness) never
/// touch it.
pub struct IdleMonitor {
    last_request_unix_ms: AtomicI64,
    excluded_paths: Vec<String>,
    idle_timeout: Duration,
}

impl IdleMonitor {
    pub fn new(excluded_paths: Vec<String>, idle_timeout_secs: u64) -> Self {
        Self {
            last_request_unix_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            excluded_paths,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
        }
    }

    /// Resets the idle clock for a request against `path`, unless excluded.
    pub fn touch(&self, path: &str) {
        if self.excluded_paths.iter().any(|excluded| excluded == path) {
            return;
        }
        self.last_request_unix_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_request_unix_ms.load(Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();
        Duration::from_millis(now.saturating_sub(last).max(0) as u64)
    }

    /// Ticks every second; once idle past `idle_timeout` with zero active
    /// jobs, cancels `shutdown` and returns. There's no notion of a live
    /// debug connection in this crate (no persistent debug session state is
    /// tracked anywhere in the data model), so `BackgroundWorkCheck` reduces
    /// to "the worker pool reports zero active jobs".
    pub async fn run(self: Arc<Self>, worker_pool: Arc<WorkerPool>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }

            if self.idle_for() > self.idle_timeout && worker_pool.active_jobs() == 0 {
                tracing::info!(idle_for_secs = self.idle_for().as_secs(), "idle timeout reached, signalling shutdown");
                shutdown.cancel();
                return;
            }
        }
    }
}
