//! Product quantization: each vector (or its IVF residual) is split into
//! `num_sub_vectors` contiguous segments, and each segment is replaced by the
//! id of its nearest codeword in that segment's codebook.
//!
//! Codebooks hold `2^num_bits` codewords of `dim / num_sub_vectors`
//! components and are trained to minimize L2 reconstruction error whatever
//! the index metric.
//!
//! ## Binary format (`pq.bin`)
//!
//! ```text
//! [magic "QPQC"][version: u8][metric: u8][num_bits: u8][use_residual: u8]
//! [num_sub_vectors: u32][dim: u32]
//! [centroid set] * num_sub_vectors
//! [xxh3: u64]
//! ```

use std::borrow::Cow;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info};

use crate::cancel::Cancellation;
use crate::codec::{put_u32, seal, unseal, BlobKind, Reader};
use crate::error::{QuiverError, Result};
use crate::index::assign::BatchDistanceComputer;
use crate::index::centroids::CentroidSet;
use crate::index::ivf::{metric_from_tag, metric_tag, IvfModel};
use crate::index::kmeans::{KMeans, KMeansParams, SEEDING_CHUNK_ROWS};
use crate::index::params::{IndexParams, MAX_NUM_BITS};
use crate::types::{DistanceMetric, Geometry, VectorBatch};

const PQ_MAGIC: &[u8; 4] = b"QPQC";
const PQ_FORMAT_VERSION: u8 = 1;

/// On-disk width of one PQ code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeWidth {
    U8,
    U16,
}

impl CodeWidth {
    pub fn for_bits(num_bits: u8) -> Self {
        if num_bits <= 8 {
            CodeWidth::U8
        } else {
            CodeWidth::U16
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            CodeWidth::U8 => 1,
            CodeWidth::U16 => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
    metric: DistanceMetric,
    num_sub_vectors: usize,
    num_bits: u8,
    dim: usize,
    use_residual: bool,
    codebooks: Vec<CentroidSet>,
}

impl ProductQuantizer {
    /// Train one codebook per sub-vector segment.
    pub fn train(
        sample: &VectorBatch,
        ivf: &IvfModel,
        params: &IndexParams,
        computer: &dyn BatchDistanceComputer,
        cancel: &Cancellation,
    ) -> Result<Self> {
        let start = Instant::now();
        let dim = sample.dim;
        params.validate(dim)?;
        if ivf.dim() != dim {
            return Err(QuiverError::DimensionMismatch {
                expected: ivf.dim(),
                actual: dim,
            });
        }
        let k = params.codebook_size();
        if sample.len() < k {
            return Err(QuiverError::InsufficientData {
                required: k,
                available: sample.len(),
            });
        }

        let m = params.num_sub_vectors;
        let sub_dim = dim / m;
        let use_residual = params.effective_residual();
        let mut quantizer = Self {
            metric: params.metric,
            num_sub_vectors: m,
            num_bits: params.num_bits,
            dim,
            use_residual,
            codebooks: Vec::with_capacity(m),
        };

        let prepared = ivf.prepare(&sample.values);
        let training = if use_residual {
            let partitions: Vec<u32> = computer
                .nearest(&prepared, ivf.centroids(), ivf.metric().geometry())?
                .into_iter()
                .map(|n| n.id)
                .collect();
            quantizer.transform(ivf, prepared, &partitions)
        } else {
            prepared
        };

        for sub in 0..m {
            cancel.check()?;
            let segment = extract_segment(&training, dim, sub, sub_dim);
            let result = KMeans::new(
                KMeansParams {
                    k,
                    max_iterations: params.max_iterations,
                    tolerance: params.tolerance,
                    geometry: Geometry::L2,
                    normalize_centroids: false,
                    seed: params.seed.wrapping_add(1 + sub as u64),
                    chunk_size: SEEDING_CHUNK_ROWS,
                },
                computer,
            )
            .train(&segment, sub_dim, cancel)?;
            debug!(
                sub_vector = sub,
                iterations = result.iterations,
                inertia = result.inertia,
                "trained PQ codebook"
            );
            quantizer.codebooks.push(result.centroids);
        }

        crate::metrics::TRAINING_DURATION
            .with_label_values(&["pq"])
            .observe(start.elapsed().as_secs_f64());
        info!(
            num_sub_vectors = m,
            num_bits = params.num_bits,
            residual = use_residual,
            sample = sample.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "trained PQ codebooks"
        );
        Ok(quantizer)
    }

    pub fn num_sub_vectors(&self) -> usize {
        self.num_sub_vectors
    }

    pub fn num_bits(&self) -> u8 {
        self.num_bits
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn sub_dim(&self) -> usize {
        self.dim / self.num_sub_vectors
    }

    pub fn use_residual(&self) -> bool {
        self.use_residual
    }

    pub fn codebooks(&self) -> &[CentroidSet] {
        &self.codebooks
    }

    pub fn code_width(&self) -> CodeWidth {
        CodeWidth::for_bits(self.num_bits)
    }

    /// Residuals against each row's partition, or the rows themselves.
    fn transform<'a>(
        &self,
        ivf: &IvfModel,
        prepared: Cow<'a, [f32]>,
        partitions: &[u32],
    ) -> Cow<'a, [f32]> {
        if !self.use_residual {
            return prepared;
        }
        let mut out = prepared.into_owned();
        for (row, &p) in out.chunks_exact_mut(self.dim).zip(partitions) {
            let copy = row.to_vec();
            ivf.residual_into(&copy, p, row);
        }
        Cow::Owned(out)
    }

    /// Encode rows already assigned to `partitions`.
    ///
    /// `values` are raw input rows; the metric transform is applied here.
    /// Returns `num_sub_vectors` codes per row, row-major.
    pub fn encode(
        &self,
        ivf: &IvfModel,
        values: &[f32],
        partitions: &[u32],
        computer: &dyn BatchDistanceComputer,
    ) -> Result<Vec<u16>> {
        if values.len() != partitions.len() * self.dim {
            return Err(QuiverError::DimensionMismatch {
                expected: partitions.len() * self.dim,
                actual: values.len(),
            });
        }
        let n = partitions.len();
        let m = self.num_sub_vectors;
        let sub_dim = self.sub_dim();
        let transformed = self.transform(ivf, ivf.prepare(values), partitions);

        let mut codes = vec![0u16; n * m];
        for (sub, codebook) in self.codebooks.iter().enumerate() {
            let segment = extract_segment(&transformed, self.dim, sub, sub_dim);
            let nearest = computer.nearest(&segment, codebook, Geometry::L2)?;
            for (row, nst) in nearest.into_iter().enumerate() {
                codes[row * m + sub] = nst.id as u16;
            }
        }
        Ok(codes)
    }

    /// Approximate reconstruction of one encoded row (in the prepared space).
    pub fn decode(&self, ivf: &IvfModel, code: &[u16], partition: u32) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim);
        for (sub, &c) in code.iter().enumerate() {
            out.extend_from_slice(self.codebooks[sub].centroid(c as usize));
        }
        if self.use_residual {
            let centroid = ivf.centroids().centroid(partition as usize);
            for (o, &cv) in out.iter_mut().zip(centroid) {
                *o += cv;
            }
        }
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::new();
        buf.extend_from_slice(PQ_MAGIC);
        buf.push(PQ_FORMAT_VERSION);
        buf.push(metric_tag(self.metric));
        buf.push(self.num_bits);
        buf.push(self.use_residual as u8);
        put_u32(&mut buf, self.num_sub_vectors as u32);
        put_u32(&mut buf, self.dim as u32);
        for codebook in &self.codebooks {
            codebook.write_to(&mut buf);
        }
        seal(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let payload = unseal(data, BlobKind::Index)?;
        let mut reader = Reader::new(payload, BlobKind::Index);
        reader.expect_magic(PQ_MAGIC)?;
        let version = reader.u8()?;
        if version != PQ_FORMAT_VERSION {
            return Err(QuiverError::CorruptIndex(format!(
                "unsupported PQ format version {version}"
            )));
        }
        let tag = reader.u8()?;
        let metric = metric_from_tag(tag, &reader)?;
        let num_bits = reader.u8()?;
        let use_residual = reader.u8()? != 0;
        let num_sub_vectors = reader.u32()? as usize;
        let dim = reader.u32()? as usize;
        if num_bits == 0 || num_bits > MAX_NUM_BITS {
            return Err(QuiverError::CorruptIndex(format!("invalid num_bits {num_bits}")));
        }
        if num_sub_vectors == 0 || dim % num_sub_vectors != 0 {
            return Err(QuiverError::CorruptIndex(format!(
                "dim {dim} not divisible by num_sub_vectors {num_sub_vectors}"
            )));
        }

        let mut codebooks = Vec::with_capacity(num_sub_vectors);
        for sub in 0..num_sub_vectors {
            let codebook = CentroidSet::read_from(&mut reader)?;
            if codebook.dim() != dim / num_sub_vectors || codebook.len() != 1usize << num_bits {
                return Err(QuiverError::CorruptIndex(format!(
                    "codebook {sub} has shape {}x{}, expected {}x{}",
                    codebook.len(),
                    codebook.dim(),
                    1usize << num_bits,
                    dim / num_sub_vectors
                )));
            }
            codebooks.push(codebook);
        }
        reader.finish()?;

        Ok(Self {
            metric,
            num_sub_vectors,
            num_bits,
            dim,
            use_residual,
            codebooks,
        })
    }
}

/// Copy columns `[sub * sub_dim, (sub + 1) * sub_dim)` of every row.
fn extract_segment(values: &[f32], dim: usize, sub: usize, sub_dim: usize) -> Vec<f32> {
    let offset = sub * sub_dim;
    let mut out = Vec::with_capacity(values.len() / dim * sub_dim);
    for row in values.chunks_exact(dim) {
        out.extend_from_slice(&row[offset..offset + sub_dim]);
    }
    out
}
