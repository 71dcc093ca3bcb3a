//! Object storage abstraction for manifests and artifacts
//! Uses Apache Arrow object_store crate

use chrono::{DateTime, Utc};
use object_store::{GetOptions, ObjectStore, path::Path as StoragePath};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata returned after upload
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub key: String,
    pub etag: Option<String>,
    pub size: usize,
}

/// Storage client wrapping object_store
#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

impl StorageClient {
    /// Create new storage client with any object_store backend
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self { store, bucket }
    }

    /// Create in-memory storage for testing/development
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(object_store::memory::InMemory::new()),
            bucket: "refyne-local".to_string(),
        }
    }

    /// Upload bytes to storage
    pub async fn upload(&self, key: &str, data: Vec<u8>) -> Result<UploadMetadata> {
        let path = StoragePath::from(key);
        let size = data.len();

        let put_result = self.store
            .put(&path, data.into())
            .await?;

        tracing::info!(key, size, "Uploaded to storage");

        Ok(UploadMetadata {
            key: key.to_string(),
            etag: put_result.e_tag.clone(),
            size,
        })
    }

    /// Download from storage
    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = StoragePath::from(key);

        let result = self.store
            .get(&path)
            .await?;

        let bytes = result.bytes().await?;

        tracing::info!(key, size = bytes.len(), "Downloaded from storage");

        Ok(bytes.to_vec())
    }

    /// Check if key exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = StoragePath::from(key);

        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Conditional GET honoring a previously-seen ETag, for the dynamic config
    /// loaders' `If-None-Match` refresh cycle (spec §4.B).
    pub async fn get_conditional(
        &self,
        key: &str,
        known_etag: Option<&str>,
    ) -> Result<ConditionalGetResult> {
        let path = StoragePath::from(key);
        let mut opts = GetOptions::default();
        if let Some(etag) = known_etag {
            opts.if_none_match = Some(etag.to_string());
        }

        match self.store.get_opts(&path, opts).await {
            Ok(result) => {
                let etag = result.meta.e_tag.clone();
                let bytes = result.bytes().await?;
                Ok(ConditionalGetResult::Modified {
                    bytes: bytes.to_vec(),
                    etag,
                })
            }
            Err(object_store::Error::NotModified { .. }) => Ok(ConditionalGetResult::NotModified),
            Err(object_store::Error::NotFound { .. }) => Ok(ConditionalGetResult::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists objects directly under `prefix`, for the cleanup scheduler's
    /// debug-capture reap (spec §4.L). Non-recursive, matching how debug
    /// captures are written (one flat `debug/{job_id}/{hash}.html` key per
    /// capture, no further nesting).
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let path = StoragePath::from(prefix);
        let result = self.store.list_with_delimiter(Some(&path)).await?;
        Ok(result
            .objects
            .into_iter()
            .map(|meta| ObjectSummary { key: meta.location.to_string(), last_modified: meta.last_modified })
            .collect())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = StoragePath::from(key);
        self.store.delete(&path).await?;
        Ok(())
    }
}

/// Listing entry returned by [`StorageClient::list_prefix`].
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Outcome of a conditional GET against the object store.
#[derive(Debug)]
pub enum ConditionalGetResult {
    /// Remote returned 304: the cached value is still current.
    NotModified,
    /// Remote returned a new body and (possibly) a new ETag.
    Modified {
        bytes: Vec<u8>,
        etag: Option<String>,
    },
    /// The object does not exist.
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_and_download_roundtrip() {
        let client = StorageClient::in_memory();
        client.upload("config/blocklist.json", b"[]".to_vec()).await.unwrap();
        let data = client.download("config/blocklist.json").await.unwrap();
        assert_eq!(data, b"[]");
    }

    #[tokio::test]
    async fn test_exists() {
        let client = StorageClient::in_memory();
        assert!(!client.exists("missing.json").await.unwrap());
        client.upload("present.json", b"{}".to_vec()).await.unwrap();
        assert!(client.exists("present.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_get_returns_not_found_for_missing_key() {
        let client = StorageClient::in_memory();
        let result = client.get_conditional("nope.json", None).await.unwrap();
        assert!(matches!(result, ConditionalGetResult::NotFound));
    }

    #[tokio::test]
    async fn test_list_prefix_and_delete() {
        let client = StorageClient::in_memory();
        client.upload("debug/job_1/a.html", b"<html></html>".to_vec()).await.unwrap();
        client.upload("debug/job_1/b.html", b"<html></html>".to_vec()).await.unwrap();

        let objects = client.list_prefix("debug/job_1").await.unwrap();
        assert_eq!(objects.len(), 2);

        client.delete(&objects[0].key).await.unwrap();
        let remaining = client.list_prefix("debug/job_1").await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_get_returns_modified_on_first_fetch() {
        let client = StorageClient::in_memory();
        client.upload("tier_settings.json", b"{\"free\":{}}".to_vec()).await.unwrap();
        let result = client.get_conditional("tier_settings.json", None).await.unwrap();
        match result {
            ConditionalGetResult::Modified { bytes, .. } => {
                assert_eq!(bytes, b"{\"free\":{}}");
            }
            other => panic!("expected Modified, got {other:?}"),
        }
    }
}
