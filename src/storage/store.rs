use bytes::Bytes;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{QuiverError, Result};

/// Thin wrapper over `object_store` used by datasets and index storage.
///
/// Every call is traced and timed into the storage metrics.
#[derive(Clone)]
pub struct QuiverStore {
    inner: Arc<dyn ObjectStore>,
}

fn observe(operation: &str, start: std::time::Instant) {
    crate::metrics::STORAGE_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(start.elapsed().as_secs_f64());
}

fn count_error(operation: &str) {
    crate::metrics::STORAGE_ERRORS_TOTAL
        .with_label_values(&[operation])
        .inc();
}

fn map_not_found(e: object_store::Error) -> QuiverError {
    match e {
        object_store::Error::NotFound { path, .. } => QuiverError::NotFound { key: path },
        other => QuiverError::Storage(other),
    }
}

impl QuiverStore {
    /// Create a store from configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.backend {
            StorageBackend::S3 => {
                let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);

                if let Some(ref region) = config.s3_region {
                    builder = builder.with_region(region);
                }
                if let Some(ref endpoint) = config.s3_endpoint {
                    if !endpoint.is_empty() {
                        builder = builder.with_endpoint(endpoint);
                    }
                }
                if let Some(ref key_id) = config.s3_access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(ref secret) = config.s3_secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                if config.s3_allow_http {
                    builder = builder.with_allow_http(true);
                }

                // Manifest publishing relies on ETag conditional PUT.
                builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch);

                let client_options = ClientOptions::new()
                    .with_pool_max_idle_per_host(64)
                    .with_timeout(std::time::Duration::from_secs(60))
                    .with_connect_timeout(std::time::Duration::from_secs(10));
                builder = builder.with_client_options(client_options);

                Arc::new(builder.build().map_err(|e| {
                    QuiverError::Config(format!("failed to build S3 store: {e}"))
                })?)
            }
            StorageBackend::Local => {
                let path = std::path::Path::new(&config.bucket);
                if !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(path).map_err(|e| {
                        QuiverError::Config(format!("failed to build local store: {e}"))
                    })?,
                )
            }
            StorageBackend::Memory => Arc::new(object_store::memory::InMemory::new()),
        };

        debug!(backend = %config.backend, bucket = %config.bucket, "object store ready");
        Ok(Self { inner: store })
    }

    /// Wrap an existing `ObjectStore` (tests, benches).
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { inner: store }
    }

    /// Fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    #[instrument(skip(self, data), fields(key = key, size = data.len()))]
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        self.inner
            .put(&path, PutPayload::from(data))
            .await
            .inspect_err(|_| count_error("put"))?;
        debug!(elapsed_ms = start.elapsed().as_millis(), "store put");
        observe("put", start);
        Ok(())
    }

    /// Get an object by key. Returns `NotFound` if it doesn't exist.
    #[instrument(skip(self), fields(key = key))]
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let result = self.inner.get(&path).await.map_err(|e| {
            count_error("get");
            map_not_found(e)
        })?;
        let bytes = result.bytes().await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            size = bytes.len(),
            "store get"
        );
        observe("get", start);
        Ok(bytes)
    }

    /// Get an object along with its ETag for CAS writes.
    #[instrument(skip(self), fields(key = key))]
    pub async fn get_with_meta(&self, key: &str) -> Result<(Bytes, Option<String>)> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let result = self.inner.get(&path).await.map_err(|e| {
            count_error("get");
            map_not_found(e)
        })?;
        let etag = result.meta.e_tag.clone();
        let bytes = result.bytes().await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            size = bytes.len(),
            etag = ?etag,
            "store get_with_meta"
        );
        observe("get", start);
        Ok((bytes, etag))
    }

    /// Put only if the current ETag matches (compare-and-swap).
    ///
    /// Returns `ManifestConflict` for `uri` when the object changed since it
    /// was read. Backends without native conditional update (local
    /// filesystem) are checked with a HEAD before the write, which is only
    /// safe under the per-process single-writer locks.
    #[instrument(skip(self, data), fields(key = key))]
    pub async fn put_if_match(&self, key: &str, data: Bytes, etag: &str, uri: &str) -> Result<()> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let options = PutOptions {
            mode: PutMode::Update(UpdateVersion {
                e_tag: Some(etag.to_string()),
                version: None,
            }),
            ..PutOptions::default()
        };
        let conflict = || QuiverError::ManifestConflict {
            uri: uri.to_string(),
        };
        match self
            .inner
            .put_opts(&path, PutPayload::from(data.clone()), options)
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::Precondition { .. }) => return Err(conflict()),
            Err(object_store::Error::NotImplemented) => {
                let current = self.inner.head(&path).await.map_err(map_not_found)?;
                if current.e_tag.as_deref() != Some(etag) {
                    return Err(conflict());
                }
                self.inner.put(&path, PutPayload::from(data)).await?;
            }
            Err(other) => {
                count_error("put");
                return Err(QuiverError::Storage(other));
            }
        }
        debug!(elapsed_ms = start.elapsed().as_millis(), "store put_if_match");
        observe("put", start);
        Ok(())
    }

    /// Create an object only if nothing exists at `key`.
    ///
    /// Returns `false` without writing when the key is already taken.
    #[instrument(skip(self, data), fields(key = key))]
    pub async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<bool> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let options = PutOptions {
            mode: PutMode::Create,
            ..PutOptions::default()
        };
        let created = match self
            .inner
            .put_opts(&path, PutPayload::from(data), options)
            .await
        {
            Ok(_) => true,
            Err(object_store::Error::AlreadyExists { .. }) => {
                debug!(key = %path, "put_if_not_exists: object already exists");
                false
            }
            Err(other) => {
                count_error("put");
                return Err(QuiverError::Storage(other));
            }
        };
        debug!(elapsed_ms = start.elapsed().as_millis(), created, "store put_if_not_exists");
        observe("put", start);
        Ok(created)
    }

    /// Delete an object. Missing objects are not an error.
    #[instrument(skip(self), fields(key = key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => {
                count_error("delete");
                return Err(QuiverError::Storage(e));
            }
        }
        debug!(elapsed_ms = start.elapsed().as_millis(), "store delete");
        observe("delete", start);
        Ok(())
    }

    /// List object keys under a prefix, sorted.
    #[instrument(skip(self), fields(prefix = prefix))]
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        use futures::TryStreamExt;
        let start = std::time::Instant::now();
        let path = Path::parse(prefix)?;
        let objects: Vec<_> = self
            .inner
            .list(Some(&path))
            .try_collect()
            .await
            .inspect_err(|_| count_error("list_prefix"))?;
        let mut keys: Vec<String> = objects.iter().map(|o| o.location.to_string()).collect();
        keys.sort();
        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            count = keys.len(),
            "store list_prefix"
        );
        observe("list_prefix", start);
        Ok(keys)
    }

    #[instrument(skip(self), fields(key = key))]
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let result = match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => {
                count_error("exists");
                Err(QuiverError::Storage(e))
            }
        };
        observe("exists", start);
        result
    }

    /// Delete every object under a prefix. Returns the number removed.
    #[instrument(skip(self), fields(prefix = prefix))]
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let start = std::time::Instant::now();
        let keys = self.list_prefix(prefix).await?;
        let count = keys.len();
        let results =
            futures::future::join_all(keys.iter().map(|key| self.delete(key))).await;
        for result in results {
            result?;
        }
        debug!(elapsed_ms = start.elapsed().as_millis(), count, "store delete_prefix");
        observe("delete_prefix", start);
        Ok(count)
    }
}
