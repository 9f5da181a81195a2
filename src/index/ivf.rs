//! IVF partitioning model: one centroid per partition.
//!
//! ## Binary format (`ivf.bin`)
//!
//! ```text
//! [magic "QIVF"][version: u8][metric: u8]
//! [centroid set]
//! [xxh3: u64]
//! ```

use std::borrow::Cow;
use std::time::Instant;

use bytes::Bytes;
use tracing::info;

use crate::cancel::Cancellation;
use crate::codec::{seal, unseal, BlobKind, Reader};
use crate::error::{QuiverError, Result};
use crate::index::assign::BatchDistanceComputer;
use crate::index::centroids::CentroidSet;
use crate::index::distance::normalize_rows;
use crate::index::kmeans::{KMeans, KMeansParams, SEEDING_CHUNK_ROWS};
use crate::index::params::IndexParams;
use crate::types::{DistanceMetric, VectorBatch};

const IVF_MAGIC: &[u8; 4] = b"QIVF";
const IVF_FORMAT_VERSION: u8 = 1;

pub(crate) fn metric_tag(metric: DistanceMetric) -> u8 {
    match metric {
        DistanceMetric::L2 => 0,
        DistanceMetric::Cosine => 1,
        DistanceMetric::Dot => 2,
    }
}

pub(crate) fn metric_from_tag(tag: u8, reader: &Reader<'_>) -> Result<DistanceMetric> {
    match tag {
        0 => Ok(DistanceMetric::L2),
        1 => Ok(DistanceMetric::Cosine),
        2 => Ok(DistanceMetric::Dot),
        other => Err(reader.malformed(format!("unknown metric tag {other}"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IvfModel {
    metric: DistanceMetric,
    centroids: CentroidSet,
}

impl IvfModel {
    pub fn new(metric: DistanceMetric, centroids: CentroidSet) -> Self {
        Self { metric, centroids }
    }

    /// Train `params.num_partitions` centroids on a sample.
    pub fn train(
        sample: &VectorBatch,
        params: &IndexParams,
        computer: &dyn BatchDistanceComputer,
        cancel: &Cancellation,
    ) -> Result<Self> {
        let start = Instant::now();
        let metric = params.metric;
        let data = prepare_rows(metric, &sample.values, sample.dim);
        let result = KMeans::new(
            KMeansParams {
                k: params.num_partitions,
                max_iterations: params.max_iterations,
                tolerance: params.tolerance,
                geometry: metric.geometry(),
                normalize_centroids: metric.normalizes_centroids(),
                seed: params.seed,
                chunk_size: SEEDING_CHUNK_ROWS,
            },
            computer,
        )
        .train(&data, sample.dim, cancel)?;

        crate::metrics::TRAINING_DURATION
            .with_label_values(&["ivf"])
            .observe(start.elapsed().as_secs_f64());
        info!(
            partitions = params.num_partitions,
            sample = sample.len(),
            iterations = result.iterations,
            reseeded = result.reseeded,
            elapsed_ms = start.elapsed().as_millis(),
            "trained IVF centroids"
        );
        Ok(Self::new(metric, result.centroids))
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dim(&self) -> usize {
        self.centroids.dim()
    }

    pub fn num_partitions(&self) -> usize {
        self.centroids.len()
    }

    pub fn centroids(&self) -> &CentroidSet {
        &self.centroids
    }

    /// Apply the metric's input transform (unit-normalize for cosine).
    pub fn prepare<'a>(&self, values: &'a [f32]) -> Cow<'a, [f32]> {
        prepare_rows(self.metric, values, self.dim())
    }

    /// Write `vector - centroid(partition)` into `out`.
    pub fn residual_into(&self, vector: &[f32], partition: u32, out: &mut [f32]) {
        let c = self.centroids.centroid(partition as usize);
        for ((o, &v), &cv) in out.iter_mut().zip(vector).zip(c) {
            *o = v - cv;
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(6 + self.centroids.encoded_len() + 8);
        buf.extend_from_slice(IVF_MAGIC);
        buf.push(IVF_FORMAT_VERSION);
        buf.push(metric_tag(self.metric));
        self.centroids.write_to(&mut buf);
        seal(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let payload = unseal(data, BlobKind::Index)?;
        let mut reader = Reader::new(payload, BlobKind::Index);
        reader.expect_magic(IVF_MAGIC)?;
        let version = reader.u8()?;
        if version != IVF_FORMAT_VERSION {
            return Err(QuiverError::CorruptIndex(format!(
                "unsupported IVF format version {version}"
            )));
        }
        let tag = reader.u8()?;
        let metric = metric_from_tag(tag, &reader)?;
        let centroids = CentroidSet::read_from(&mut reader)?;
        reader.finish()?;
        if centroids.is_empty() {
            return Err(QuiverError::CorruptIndex("IVF model has no centroids".into()));
        }
        Ok(Self { metric, centroids })
    }
}

pub(crate) fn prepare_rows(metric: DistanceMetric, values: &[f32], dim: usize) -> Cow<'_, [f32]> {
    if metric.normalizes_input() {
        let mut owned = values.to_vec();
        normalize_rows(&mut owned, dim);
        Cow::Owned(owned)
    } else {
        Cow::Borrowed(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::index::assign::ReferenceComputer;

    #[test]
    fn test_round_trip() {
        let centroids = CentroidSet::new(3, vec![0.1, 0.2, 0.3, -1.0, 2.5, 1e-30]).unwrap();
        let model = IvfModel::new(DistanceMetric::Cosine, centroids);
        let decoded = IvfModel::from_bytes(&model.to_bytes()).unwrap();
        assert_eq!(decoded, model);
    }

    #[test]
    fn test_corrupt_blob() {
        let centroids = CentroidSet::new(2, vec![1.0, 2.0]).unwrap();
        let mut bytes = IvfModel::new(DistanceMetric::L2, centroids).to_bytes().to_vec();
        bytes[0] = b'X';
        assert!(matches!(
            IvfModel::from_bytes(&bytes),
            Err(QuiverError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_cosine_training_normalizes() {
        let mut params = IndexParams::from_config(&IndexingConfig::default());
        params.metric = DistanceMetric::Cosine;
        params.num_partitions = 2;
        params.seed = 1;
        // Two directions at very different magnitudes.
        let mut values = Vec::new();
        let mut row_ids = Vec::new();
        for i in 0..20u64 {
            let scale = 1.0 + i as f32;
            values.extend_from_slice(&[scale, 0.01 * scale]);
            values.extend_from_slice(&[0.01 * scale, scale * 100.0]);
            row_ids.extend([2 * i, 2 * i + 1]);
        }
        let sample = VectorBatch::try_new(2, row_ids, values).unwrap();
        let ivf = IvfModel::train(
            &sample,
            &params,
            &ReferenceComputer::new(8),
            &Cancellation::none(),
        )
        .unwrap();
        assert_eq!(ivf.num_partitions(), 2);
        for c in ivf.centroids().iter() {
            let norm = crate::index::distance::norm_squared(c).sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_residual() {
        let centroids = CentroidSet::new(2, vec![1.0, 1.0, 5.0, 5.0]).unwrap();
        let ivf = IvfModel::new(DistanceMetric::L2, centroids);
        let mut out = [0.0; 2];
        ivf.residual_into(&[6.0, 4.0], 1, &mut out);
        assert_eq!(out, [1.0, -1.0]);
    }
}
