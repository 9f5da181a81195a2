use std::sync::Arc;

use quiver::config::{AcceleratorDevice, Config, StorageBackend, StorageConfig};
use quiver::index::IndexContext;
use quiver::storage::QuiverStore;

/// Isolated store for one test. `TEST_BACKEND=local` runs against a temp
/// directory instead of memory; the directory is removed on drop.
pub struct TestHarness {
    pub store: QuiverStore,
    _dir: Option<tempfile::TempDir>,
}

impl TestHarness {
    pub fn new() -> Self {
        match std::env::var("TEST_BACKEND").as_deref() {
            Ok("local") => Self::local(),
            _ => Self {
                store: QuiverStore::in_memory(),
                _dir: None,
            },
        }
    }

    pub fn local() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig {
            backend: StorageBackend::Local,
            bucket: dir.path().to_string_lossy().into_owned(),
            s3_region: None,
            s3_endpoint: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_allow_http: false,
        };
        Self {
            store: QuiverStore::from_config(&config).expect("local store"),
            _dir: Some(dir),
        }
    }
}

/// Small, fast, deterministic settings.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.indexing.kmeans_max_iterations = 5;
    config.indexing.seed = Some(42);
    config.indexing.scan_batch_size = 256;
    config.indexing.chunk_size = 128;
    config.accelerator.device = AcceleratorDevice::None;
    config
}

pub fn test_context() -> Arc<IndexContext> {
    IndexContext::new(test_config())
}
