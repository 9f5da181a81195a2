use crate::error::{QuiverError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub optimize: OptimizeConfig,
    #[serde(default)]
    pub accelerator: AcceleratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub harness: HarnessConfig,
}

/// Object-store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    S3,
    Local,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Local => write!(f, "local"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = QuiverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageBackend::S3),
            "local" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(QuiverError::Config(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Bucket name for S3, root directory for the local backend.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    // S3 / MinIO / R2
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_access_key_id: Option<String>,
    #[serde(default)]
    pub s3_secret_access_key: Option<String>,
    #[serde(default)]
    pub s3_allow_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_num_partitions")]
    pub default_num_partitions: usize,
    #[serde(default = "default_num_sub_vectors")]
    pub default_num_sub_vectors: usize,
    #[serde(default = "default_num_bits")]
    pub default_num_bits: u8,
    #[serde(default = "default_kmeans_max_iterations")]
    pub kmeans_max_iterations: usize,
    #[serde(default = "default_kmeans_tolerance")]
    pub kmeans_tolerance: f64,
    /// IVF training sample = `num_partitions * sample_rate` rows.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: usize,
    /// PQ training sample = `2^num_bits * pq_sample_rate` rows.
    #[serde(default = "default_pq_sample_rate")]
    pub pq_sample_rate: usize,
    #[serde(default = "default_use_residual")]
    pub use_residual: bool,
    /// Keep the original vector next to each PQ code in posting lists.
    #[serde(default)]
    pub store_vectors: bool,
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    /// Rows per worker chunk. Fixed so reductions never depend on the pool size.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Size of the global rayon pool; `None` lets rayon decide.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeConfig {
    /// Compact once the number of delta segments exceeds this value.
    #[serde(default = "default_max_deltas_before_compact")]
    pub max_deltas_before_compact: usize,
}

/// Accelerator device selection used by capability probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorDevice {
    /// Use whatever the probe finds.
    Auto,
    /// Report no accelerator.
    None,
    /// Blocked matrix-multiply distance computer.
    Matrix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    #[serde(default = "default_accelerator_device")]
    pub device: AcceleratorDevice,
    /// Rows per matrix block on the accelerated path.
    #[serde(default = "default_block_rows")]
    pub block_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Sizes for the benchmark scenario run by the `quiver` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_harness_uri")]
    pub dataset_uri: String,
    #[serde(default = "default_harness_rows")]
    pub num_rows: usize,
    #[serde(default = "default_harness_dim")]
    pub dim: usize,
    #[serde(default = "default_harness_num_small_indexes")]
    pub num_small_indexes: usize,
    #[serde(default = "default_harness_num_new_rows")]
    pub num_new_rows: usize,
}

// Default value functions
fn default_backend() -> StorageBackend {
    std::env::var("QUIVER_STORAGE_BACKEND")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(StorageBackend::Local)
}
fn default_bucket() -> String {
    std::env::var("QUIVER_BUCKET").unwrap_or_else(|_| "quiver-data".to_string())
}
fn default_num_partitions() -> usize {
    std::env::var("QUIVER_DEFAULT_NUM_PARTITIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(256)
}
fn default_num_sub_vectors() -> usize {
    std::env::var("QUIVER_DEFAULT_NUM_SUB_VECTORS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(16)
}
fn default_num_bits() -> u8 {
    8
}
fn default_kmeans_max_iterations() -> usize {
    50
}
fn default_kmeans_tolerance() -> f64 {
    1e-4
}
fn default_sample_rate() -> usize {
    256
}
fn default_pq_sample_rate() -> usize {
    256
}
fn default_use_residual() -> bool {
    true
}
fn default_scan_batch_size() -> usize {
    8192
}
fn default_chunk_size() -> usize {
    1024
}
fn default_max_deltas_before_compact() -> usize {
    std::env::var("QUIVER_MAX_DELTAS_BEFORE_COMPACT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4)
}
fn default_accelerator_device() -> AcceleratorDevice {
    AcceleratorDevice::Auto
}
fn default_block_rows() -> usize {
    4096
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    std::env::var("QUIVER_LOG_FORMAT").unwrap_or_else(|_| "text".to_string())
}
fn default_harness_uri() -> String {
    "bench/index_dataset".to_string()
}
fn default_harness_rows() -> usize {
    100_000
}
fn default_harness_dim() -> usize {
    512
}
fn default_harness_num_small_indexes() -> usize {
    5
}
fn default_harness_num_new_rows() -> usize {
    12_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            bucket: default_bucket(),
            s3_region: std::env::var("AWS_REGION").ok(),
            s3_endpoint: std::env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            s3_access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            s3_secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            s3_allow_http: std::env::var("S3_ALLOW_HTTP")
                .ok()
                .map(|v| v == "true")
                .unwrap_or(false),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            default_num_partitions: default_num_partitions(),
            default_num_sub_vectors: default_num_sub_vectors(),
            default_num_bits: default_num_bits(),
            kmeans_max_iterations: default_kmeans_max_iterations(),
            kmeans_tolerance: default_kmeans_tolerance(),
            sample_rate: default_sample_rate(),
            pq_sample_rate: default_pq_sample_rate(),
            use_residual: default_use_residual(),
            store_vectors: false,
            scan_batch_size: default_scan_batch_size(),
            chunk_size: default_chunk_size(),
            seed: None,
            worker_threads: None,
        }
    }
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            max_deltas_before_compact: default_max_deltas_before_compact(),
        }
    }
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            device: default_accelerator_device(),
            block_rows: default_block_rows(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            dataset_uri: default_harness_uri(),
            num_rows: default_harness_rows(),
            dim: default_harness_dim(),
            num_small_indexes: default_harness_num_small_indexes(),
            num_new_rows: default_harness_num_new_rows(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    /// After loading, env var overrides are applied so that:
    /// env var > TOML file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    QuiverError::Config(format!("failed to read config file {p}: {e}"))
                })?;
                Self::from_toml(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without applying env overrides.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| QuiverError::Config(format!("failed to parse config: {e}")))
    }

    /// Reject values that would make training or scanning meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.indexing.kmeans_max_iterations == 0 {
            return Err(QuiverError::Config(
                "indexing.kmeans_max_iterations must be > 0".into(),
            ));
        }
        if !(self.indexing.kmeans_tolerance >= 0.0) {
            return Err(QuiverError::Config(
                "indexing.kmeans_tolerance must be >= 0".into(),
            ));
        }
        if self.indexing.sample_rate == 0 || self.indexing.pq_sample_rate == 0 {
            return Err(QuiverError::Config(
                "indexing sample rates must be > 0".into(),
            ));
        }
        if self.indexing.scan_batch_size == 0 || self.indexing.chunk_size == 0 {
            return Err(QuiverError::Config(
                "indexing.scan_batch_size and indexing.chunk_size must be > 0".into(),
            ));
        }
        if self.accelerator.block_rows == 0 {
            return Err(QuiverError::Config(
                "accelerator.block_rows must be > 0".into(),
            ));
        }
        if matches!(self.indexing.worker_threads, Some(0)) {
            return Err(QuiverError::Config(
                "indexing.worker_threads must be > 0 when set".into(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides on top of file/default values.
    fn apply_env_overrides(&mut self) {
        // Storage
        if let Some(v) = std::env::var("QUIVER_STORAGE_BACKEND")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.storage.backend = v;
        }
        if let Ok(v) = std::env::var("QUIVER_BUCKET") {
            self.storage.bucket = v;
        }
        if let Ok(v) = std::env::var("AWS_REGION") {
            self.storage.s3_region = Some(v);
        }
        if let Some(v) = std::env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()) {
            self.storage.s3_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_ACCESS_KEY_ID") {
            self.storage.s3_access_key_id = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            self.storage.s3_secret_access_key = Some(v);
        }
        if let Ok(v) = std::env::var("S3_ALLOW_HTTP") {
            self.storage.s3_allow_http = v == "true";
        }

        // Indexing
        if let Some(v) = std::env::var("QUIVER_DEFAULT_NUM_PARTITIONS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.indexing.default_num_partitions = v;
        }
        if let Some(v) = std::env::var("QUIVER_DEFAULT_NUM_SUB_VECTORS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.indexing.default_num_sub_vectors = v;
        }
        if let Some(v) = std::env::var("QUIVER_SEED")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.indexing.seed = Some(v);
        }
        if let Some(v) = std::env::var("QUIVER_WORKER_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.indexing.worker_threads = Some(v);
        }

        // Optimize
        if let Some(v) = std::env::var("QUIVER_MAX_DELTAS_BEFORE_COMPACT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.optimize.max_deltas_before_compact = v;
        }

        // Accelerator
        if let Ok(v) = std::env::var("QUIVER_ACCELERATOR") {
            match v.to_ascii_lowercase().as_str() {
                "auto" => self.accelerator.device = AcceleratorDevice::Auto,
                "none" => self.accelerator.device = AcceleratorDevice::None,
                "matrix" => self.accelerator.device = AcceleratorDevice::Matrix,
                other => tracing::warn!(value = other, "ignoring unknown QUIVER_ACCELERATOR"),
            }
        }

        // Logging
        if let Ok(v) = std::env::var("QUIVER_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}
