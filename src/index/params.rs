use serde::{Deserialize, Serialize};

use crate::config::IndexingConfig;
use crate::error::{QuiverError, Result};
use crate::types::{Accelerator, DistanceMetric, IndexType};

/// Largest supported PQ code width in bits.
pub const MAX_NUM_BITS: u8 = 16;

/// Creation parameters of an IVF_PQ index, persisted with the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexParams {
    pub index_type: IndexType,
    pub metric: DistanceMetric,
    pub num_partitions: usize,
    pub num_sub_vectors: usize,
    pub num_bits: u8,
    /// Quantize `x - centroid(x)` instead of `x`. Ignored for dot.
    pub use_residual: bool,
    /// Keep original vectors next to the codes in posting lists.
    pub store_vectors: bool,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub sample_rate: usize,
    pub pq_sample_rate: usize,
    pub seed: u64,
}

impl IndexParams {
    /// Parameters from the configured defaults.
    pub fn from_config(config: &IndexingConfig) -> Self {
        Self {
            index_type: IndexType::IvfPq,
            metric: DistanceMetric::L2,
            num_partitions: config.default_num_partitions,
            num_sub_vectors: config.default_num_sub_vectors,
            num_bits: config.default_num_bits,
            use_residual: config.use_residual,
            store_vectors: config.store_vectors,
            max_iterations: config.kmeans_max_iterations,
            tolerance: config.kmeans_tolerance,
            sample_rate: config.sample_rate,
            pq_sample_rate: config.pq_sample_rate,
            seed: config.seed.unwrap_or_else(rand::random),
        }
    }

    /// Number of codewords per sub-vector codebook.
    pub fn codebook_size(&self) -> usize {
        1usize << self.num_bits
    }

    /// Residual quantization actually applied for this metric.
    pub fn effective_residual(&self) -> bool {
        self.use_residual && self.metric.supports_residual()
    }

    /// Rows sampled for IVF training.
    pub fn ivf_sample_size(&self, rows: usize) -> usize {
        rows.min(self.num_partitions.saturating_mul(self.sample_rate))
    }

    /// Rows sampled for PQ training.
    pub fn pq_sample_size(&self, rows: usize) -> usize {
        rows.min(self.codebook_size().saturating_mul(self.pq_sample_rate))
    }

    /// Shape checks that need only the vector dimension.
    pub fn validate(&self, dim: usize) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(QuiverError::InvalidConfig(
                "num_partitions must be >= 1".into(),
            ));
        }
        if self.num_sub_vectors == 0 {
            return Err(QuiverError::InvalidConfig(
                "num_sub_vectors must be >= 1".into(),
            ));
        }
        if self.num_bits == 0 || self.num_bits > MAX_NUM_BITS {
            return Err(QuiverError::InvalidConfig(format!(
                "num_bits must be in 1..={MAX_NUM_BITS}, got {}",
                self.num_bits
            )));
        }
        if self.max_iterations == 0 {
            return Err(QuiverError::InvalidConfig(
                "max_iterations must be >= 1".into(),
            ));
        }
        if self.sample_rate == 0 || self.pq_sample_rate == 0 {
            return Err(QuiverError::InvalidConfig(
                "sample rates must be >= 1".into(),
            ));
        }
        if dim == 0 || dim % self.num_sub_vectors != 0 {
            return Err(QuiverError::InvalidDimension {
                dim,
                num_sub_vectors: self.num_sub_vectors,
            });
        }
        Ok(())
    }

    /// Row-count preconditions, checked before any training starts.
    pub fn check_rows(&self, rows: usize) -> Result<()> {
        let required = self.num_partitions.max(self.codebook_size());
        if rows < required {
            return Err(QuiverError::InsufficientData {
                required,
                available: rows,
            });
        }
        Ok(())
    }
}

/// `create_index` arguments in their external string form.
#[derive(Debug, Clone)]
pub struct CreateIndexRequest {
    pub column: String,
    pub index_type: String,
    pub metric_type: String,
    pub num_partitions: Option<usize>,
    pub num_sub_vectors: Option<usize>,
    pub num_bits: Option<u8>,
    pub accelerator: Accelerator,
    pub replace: bool,
}

impl CreateIndexRequest {
    /// An IVF_PQ/L2 request on `column` using configured defaults.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            index_type: IndexType::IvfPq.to_string(),
            metric_type: DistanceMetric::L2.to_string(),
            num_partitions: None,
            num_sub_vectors: None,
            num_bits: None,
            accelerator: Accelerator::None,
            replace: false,
        }
    }

    pub fn metric(mut self, metric: &str) -> Self {
        self.metric_type = metric.to_string();
        self
    }

    pub fn num_partitions(mut self, n: usize) -> Self {
        self.num_partitions = Some(n);
        self
    }

    pub fn num_sub_vectors(mut self, n: usize) -> Self {
        self.num_sub_vectors = Some(n);
        self
    }

    pub fn num_bits(mut self, bits: u8) -> Self {
        self.num_bits = Some(bits);
        self
    }

    pub fn accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerator = accelerator;
        self
    }

    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    /// Parse the string fields and fill unset values from `config`.
    pub fn to_params(&self, config: &IndexingConfig) -> Result<IndexParams> {
        let index_type: IndexType = self.index_type.parse()?;
        let metric: DistanceMetric = self.metric_type.parse()?;
        let mut params = IndexParams::from_config(config);
        params.index_type = index_type;
        params.metric = metric;
        if let Some(n) = self.num_partitions {
            params.num_partitions = n;
        }
        if let Some(n) = self.num_sub_vectors {
            params.num_sub_vectors = n;
        }
        if let Some(bits) = self.num_bits {
            params.num_bits = bits;
        }
        Ok(params)
    }
}
