use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::QuiverError;

/// Row address within a dataset: `(fragment_id << 32) | offset`.
pub type RowId = u64;

/// Build a row address from a fragment id and an offset inside it.
#[inline]
pub fn row_address(fragment_id: u32, offset: u32) -> RowId {
    ((fragment_id as u64) << 32) | offset as u64
}

/// Fragment id encoded in the high 32 bits of a row address.
#[inline]
pub fn fragment_of(row_id: RowId) -> u32 {
    (row_id >> 32) as u32
}

/// Distance metric for vector comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance.
    L2,
    /// Cosine distance (vectors are normalized before L2 geometry is applied).
    Cosine,
    /// Negative inner product.
    Dot,
}

impl DistanceMetric {
    /// Whether the metric needs unit-length inputs.
    pub fn normalizes_input(self) -> bool {
        matches!(self, DistanceMetric::Cosine)
    }

    /// Whether trained centroids are projected back onto the unit sphere.
    pub fn normalizes_centroids(self) -> bool {
        matches!(self, DistanceMetric::Cosine | DistanceMetric::Dot)
    }

    /// The geometry used for nearest-centroid search.
    pub fn geometry(self) -> Geometry {
        match self {
            DistanceMetric::L2 | DistanceMetric::Cosine => Geometry::L2,
            DistanceMetric::Dot => Geometry::Dot,
        }
    }

    /// Residual quantization is only meaningful for L2-shaped geometry.
    pub fn supports_residual(self) -> bool {
        self.geometry() == Geometry::L2
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceMetric::L2 => write!(f, "l2"),
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::Dot => write!(f, "dot"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = QuiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            "cosine" => Ok(DistanceMetric::Cosine),
            "dot" | "dot_product" => Ok(DistanceMetric::Dot),
            other => Err(QuiverError::UnsupportedMetric(other.to_string())),
        }
    }
}

/// Distance geometry applied by the distance computers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    /// Squared Euclidean.
    L2,
    /// Negative inner product.
    Dot,
}

/// Index families the engine can build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    #[default]
    IvfPq,
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexType::IvfPq => write!(f, "IVF_PQ"),
        }
    }
}

impl FromStr for IndexType {
    type Err = QuiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IVF_PQ" => Ok(IndexType::IvfPq),
            other => Err(QuiverError::InvalidConfig(format!(
                "unsupported index type: {other}"
            ))),
        }
    }
}

/// How the caller wants batched distance work executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    /// Always use the reference path.
    #[default]
    None,
    /// Use the accelerator when present, fall back to the reference path.
    Preferred,
    /// Use the accelerator or fail with `AcceleratorUnavailable`.
    Required,
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Accelerator::None => write!(f, "none"),
            Accelerator::Preferred => write!(f, "preferred"),
            Accelerator::Required => write!(f, "required"),
        }
    }
}

impl FromStr for Accelerator {
    type Err = QuiverError;

    /// Accepts the request forms `none`, `preferred` (or a device name such
    /// as `cuda`, `matrix`, `auto`) and `required`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "cpu" => Ok(Accelerator::None),
            "preferred" | "present" | "auto" | "matrix" | "cuda" | "gpu" => {
                Ok(Accelerator::Preferred)
            }
            "required" => Ok(Accelerator::Required),
            other => Err(QuiverError::InvalidConfig(format!(
                "unknown accelerator: {other}"
            ))),
        }
    }
}

/// A fixed-dimension column of vectors with their row addresses.
///
/// Values are stored row-major: row `i` is `values[i * dim..(i + 1) * dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorBatch {
    pub dim: usize,
    pub row_ids: Vec<RowId>,
    pub values: Vec<f32>,
}

impl VectorBatch {
    /// Build a batch, validating that the value count matches `dim`.
    pub fn try_new(dim: usize, row_ids: Vec<RowId>, values: Vec<f32>) -> crate::error::Result<Self> {
        if dim == 0 {
            return Err(QuiverError::InvalidConfig("vector dimension must be > 0".into()));
        }
        if values.len() != row_ids.len() * dim {
            return Err(QuiverError::DimensionMismatch {
                expected: row_ids.len() * dim,
                actual: values.len(),
            });
        }
        Ok(Self {
            dim,
            row_ids,
            values,
        })
    }

    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            row_ids: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.row_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.values[i * self.dim..(i + 1) * self.dim]
    }

    /// Append every row of `other`. Dimensions must agree.
    pub fn extend(&mut self, other: &VectorBatch) -> crate::error::Result<()> {
        if other.dim != self.dim {
            return Err(QuiverError::DimensionMismatch {
                expected: self.dim,
                actual: other.dim,
            });
        }
        self.row_ids.extend_from_slice(&other.row_ids);
        self.values.extend_from_slice(&other.values);
        Ok(())
    }
}
