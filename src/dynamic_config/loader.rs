//! Generic ETag-conditional config loader (spec §4.B), grounded on the
//! teacher's `FjallStore`-fronting `RwLock`-guarded cache pattern,
//! generalized from an embedded store to a remote S3 object.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, RwLock};

use crate::storage::{ConditionalGetResult, StorageClient};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct LoaderStats {
    pub initialized: bool,
    pub etag: Option<String>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub key: String,
}

struct State<T> {
    value: Arc<T>,
    etag: Option<String>,
    initialized: bool,
    last_fetch: Option<DateTime<Utc>>,
    last_check: Option<DateTime<Utc>>,
    error_backoff_until: Option<DateTime<Utc>>,
}

/// One (bucket-implicit, key) config document, cached in memory with
/// single-flight refresh and stale-reuse on transport/parse error.
pub struct DynamicConfigLoader<T> {
    client: StorageClient,
    key: String,
    cache_ttl: chrono::Duration,
    error_backoff: chrono::Duration,
    state: RwLock<State<T>>,
    is_fetching: AtomicBool,
    fetch_done: Notify,
}

impl<T: DeserializeOwned + Default + Send + Sync + 'static> DynamicConfigLoader<T> {
    pub fn new(client: StorageClient, key: impl Into<String>, cache_ttl: Duration, error_backoff: Duration) -> Self {
        Self {
            client,
            key: key.into(),
            cache_ttl: chrono::Duration::from_std(cache_ttl).unwrap_or(chrono::Duration::seconds(300)),
            error_backoff: chrono::Duration::from_std(error_backoff).unwrap_or(chrono::Duration::seconds(60)),
            state: RwLock::new(State {
                value: Arc::new(T::default()),
                etag: None,
                initialized: false,
                last_fetch: None,
                last_check: None,
                error_backoff_until: None,
            }),
            is_fetching: AtomicBool::new(false),
            fetch_done: Notify::new(),
        }
    }

    /// Synchronous first load for boot-time priming.
    pub async fn load(&self) -> Arc<T> {
        self.fetch().await;
        self.current().await
    }

    pub async fn current(&self) -> Arc<T> {
        self.state.read().await.value.clone()
    }

    /// Non-blocking; triggers a background-equivalent fetch only when
    /// stale, not in error backoff, and not already in flight (spec §4.B).
    pub async fn maybe_refresh(&self) {
        let should_fetch = {
            let state = self.state.read().await;
            let now = Utc::now();
            let stale = state.last_check.map(|t| now - t > self.cache_ttl).unwrap_or(true);
            let in_backoff = state.error_backoff_until.map(|t| now < t).unwrap_or(false);
            stale && !in_backoff
        };

        if !should_fetch {
            return;
        }

        if self.is_fetching.swap(true, Ordering::AcqRel) {
            self.fetch_done.notified().await;
            return;
        }

        self.fetch().await;
        self.is_fetching.store(false, Ordering::Release);
        self.fetch_done.notify_waiters();
    }

    async fn fetch(&self) {
        let known_etag = self.state.read().await.etag.clone();

        match self.client.get_conditional(&self.key, known_etag.as_deref()).await {
            Ok(ConditionalGetResult::NotModified) => {
                let mut state = self.state.write().await;
                state.last_check = Some(Utc::now());
            }
            Ok(ConditionalGetResult::Modified { bytes, etag }) => match serde_json::from_slice::<T>(&bytes) {
                Ok(parsed) => {
                    let now = Utc::now();
                    let mut state = self.state.write().await;
                    state.value = Arc::new(parsed);
                    state.etag = etag;
                    state.initialized = true;
                    state.last_fetch = Some(now);
                    state.last_check = Some(now);
                    state.error_backoff_until = None;
                }
                Err(error) => {
                    tracing::warn!(key = %self.key, %error, "dynamic config parse failure, keeping cached value");
                    let mut state = self.state.write().await;
                    state.last_check = Some(Utc::now());
                    state.error_backoff_until = Some(Utc::now() + self.error_backoff);
                }
            },
            Ok(ConditionalGetResult::NotFound) => {
                let mut state = self.state.write().await;
                if !state.initialized {
                    state.initialized = true;
                    tracing::warn!(key = %self.key, "dynamic config object missing, initialized with default");
                }
                state.last_check = Some(Utc::now());
            }
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "dynamic config fetch failed, keeping cached value");
                let mut state = self.state.write().await;
                state.last_check = Some(Utc::now());
                state.error_backoff_until = Some(Utc::now() + self.error_backoff);
            }
        }
    }

    pub async fn stats(&self) -> LoaderStats {
        let state = self.state.read().await;
        LoaderStats {
            initialized: state.initialized,
            etag: state.etag.clone(),
            last_fetch: state.last_fetch,
            last_check: state.last_check,
            key: self.key.clone(),
        }
    }
}
