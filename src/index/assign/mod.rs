//! Nearest-centroid assignment behind the `BatchDistanceComputer` capability.
//!
//! The reference computer scores every (row, centroid) pair with the scalar
//! kernels. The matrix computer batches the work as a GEMM and re-scores the
//! close candidates with the same kernels, so both produce the same ids and
//! distances. Lowest id wins on exact ties.

pub mod matrix;
pub mod reference;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{AcceleratorConfig, AcceleratorDevice};
use crate::error::{QuiverError, Result};
use crate::index::centroids::CentroidSet;
use crate::index::ivf::IvfModel;
use crate::types::{Accelerator, Geometry, RowId, VectorBatch};

pub use matrix::MatrixComputer;
pub use reference::ReferenceComputer;

/// Id and distance of the closest centroid for one row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    pub id: u32,
    pub distance: f32,
}

/// Batched nearest-centroid search.
///
/// `vectors` is row-major with `centroids.dim()` columns. Implementations
/// return one entry per row, in row order.
pub trait BatchDistanceComputer: Send + Sync + std::fmt::Debug {
    /// Short label used in logs and metrics (`"reference"`, `"matrix"`).
    fn name(&self) -> &'static str;

    fn nearest(
        &self,
        vectors: &[f32],
        centroids: &CentroidSet,
        geometry: Geometry,
    ) -> Result<Vec<Nearest>>;
}

pub(crate) fn check_input(vectors: &[f32], centroids: &CentroidSet) -> Result<()> {
    if centroids.is_empty() {
        return Err(QuiverError::InvalidConfig(
            "cannot assign against an empty centroid set".into(),
        ));
    }
    if vectors.len() % centroids.dim() != 0 {
        return Err(QuiverError::DimensionMismatch {
            expected: centroids.dim(),
            actual: vectors.len() % centroids.dim(),
        });
    }
    Ok(())
}

/// Report the accelerated computer, if the configured device provides one.
pub fn probe_accelerator(config: &AcceleratorConfig) -> Option<Arc<dyn BatchDistanceComputer>> {
    match config.device {
        AcceleratorDevice::Auto | AcceleratorDevice::Matrix => {
            Some(Arc::new(MatrixComputer::new(config.block_rows)))
        }
        AcceleratorDevice::None => None,
    }
}

/// Resolve a caller's accelerator request into a concrete computer.
///
/// `Preferred` falls back to the reference path when nothing is found;
/// `Required` fails with `AcceleratorUnavailable` instead.
pub fn select_computer(
    requested: Accelerator,
    config: &AcceleratorConfig,
    chunk_size: usize,
) -> Result<Arc<dyn BatchDistanceComputer>> {
    match requested {
        Accelerator::None => Ok(Arc::new(ReferenceComputer::new(chunk_size))),
        Accelerator::Preferred => match probe_accelerator(config) {
            Some(computer) => Ok(computer),
            None => {
                warn!(
                    device = ?config.device,
                    "no accelerator available, falling back to reference assignment"
                );
                crate::metrics::ACCELERATOR_FALLBACKS_TOTAL.inc();
                Ok(Arc::new(ReferenceComputer::new(chunk_size)))
            }
        },
        Accelerator::Required => {
            probe_accelerator(config).ok_or_else(|| QuiverError::AcceleratorUnavailable {
                requested: requested.to_string(),
            })
        }
    }
}

/// Row-to-partition mapping produced by one assignment pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionAssignment {
    pub row_ids: Vec<RowId>,
    pub partitions: Vec<u32>,
    pub distances: Vec<f32>,
}

impl PartitionAssignment {
    pub fn len(&self) -> usize {
        self.row_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }

    /// Number of rows per partition id.
    pub fn partition_sizes(&self, num_partitions: usize) -> Vec<usize> {
        let mut sizes = vec![0usize; num_partitions];
        for &p in &self.partitions {
            if let Some(slot) = sizes.get_mut(p as usize) {
                *slot += 1;
            }
        }
        sizes
    }

    pub fn extend(&mut self, other: PartitionAssignment) {
        self.row_ids.extend(other.row_ids);
        self.partitions.extend(other.partitions);
        self.distances.extend(other.distances);
    }
}

/// Maps vectors to IVF partitions with a chosen computer.
#[derive(Debug, Clone)]
pub struct Assigner {
    computer: Arc<dyn BatchDistanceComputer>,
}

impl Assigner {
    pub fn new(computer: Arc<dyn BatchDistanceComputer>) -> Self {
        Self { computer }
    }

    pub fn reference(chunk_size: usize) -> Self {
        Self::new(Arc::new(ReferenceComputer::new(chunk_size)))
    }

    pub fn path(&self) -> &'static str {
        self.computer.name()
    }

    pub fn computer(&self) -> &Arc<dyn BatchDistanceComputer> {
        &self.computer
    }

    /// Assign every row of `batch` to its nearest IVF partition.
    pub fn assign(&self, ivf: &IvfModel, batch: &VectorBatch) -> Result<PartitionAssignment> {
        if batch.dim != ivf.dim() {
            return Err(QuiverError::DimensionMismatch {
                expected: ivf.dim(),
                actual: batch.dim,
            });
        }
        let start = Instant::now();
        let prepared = ivf.prepare(&batch.values);
        let nearest = self
            .computer
            .nearest(&prepared, ivf.centroids(), ivf.metric().geometry())?;
        crate::metrics::ASSIGNMENT_DURATION
            .with_label_values(&[self.path()])
            .observe(start.elapsed().as_secs_f64());
        debug!(
            rows = batch.len(),
            path = self.path(),
            elapsed_ms = start.elapsed().as_millis(),
            "assigned batch to partitions"
        );

        let (partitions, distances) = nearest.into_iter().map(|n| (n.id, n.distance)).unzip();
        Ok(PartitionAssignment {
            row_ids: batch.row_ids.clone(),
            partitions,
            distances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(device: AcceleratorDevice) -> AcceleratorConfig {
        AcceleratorConfig {
            device,
            block_rows: 16,
        }
    }

    #[test]
    fn test_select_none_is_reference() {
        let c = select_computer(Accelerator::None, &config(AcceleratorDevice::Matrix), 8).unwrap();
        assert_eq!(c.name(), "reference");
    }

    #[test]
    fn test_select_preferred_falls_back() {
        let c =
            select_computer(Accelerator::Preferred, &config(AcceleratorDevice::None), 8).unwrap();
        assert_eq!(c.name(), "reference");
        let c =
            select_computer(Accelerator::Preferred, &config(AcceleratorDevice::Auto), 8).unwrap();
        assert_eq!(c.name(), "matrix");
    }

    #[test]
    fn test_select_required_without_device_fails() {
        match select_computer(Accelerator::Required, &config(AcceleratorDevice::None), 8) {
            Err(QuiverError::AcceleratorUnavailable { requested }) => {
                assert_eq!(requested, "required")
            }
            other => panic!("expected AcceleratorUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn test_partition_sizes() {
        let a = PartitionAssignment {
            row_ids: vec![0, 1, 2, 3],
            partitions: vec![1, 0, 1, 1],
            distances: vec![0.0; 4],
        };
        assert_eq!(a.partition_sizes(3), vec![1, 3, 0]);
    }

    #[test]
    fn test_ragged_input_rejected() {
        let centroids = CentroidSet::new(2, vec![0.0, 0.0, 1.0, 1.0]).unwrap();
        assert!(check_input(&[1.0, 2.0, 3.0], &centroids).is_err());
    }
}
