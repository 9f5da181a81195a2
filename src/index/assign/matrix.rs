use faer::Mat;
use rayon::prelude::*;

use super::reference::nearest_one;
use super::{check_input, BatchDistanceComputer, Nearest};
use crate::error::Result;
use crate::index::centroids::CentroidSet;
use crate::index::distance::{distance, norm_squared};
use crate::types::Geometry;

/// GEMM-based computer: scores a block of rows against all centroids with a
/// single matrix product.
///
/// For L2 the block score is `‖x‖² − 2·x·c + ‖c‖²`, for dot it is `−x·c`.
/// Every centroid whose block score lies within the rounding bound of the
/// block minimum is re-scored with the scalar kernel, and the exact minimum
/// (lowest id on ties) is returned.
#[derive(Debug, Clone)]
pub struct MatrixComputer {
    block_rows: usize,
}

impl MatrixComputer {
    pub fn new(block_rows: usize) -> Self {
        Self {
            block_rows: block_rows.max(1),
        }
    }
}

struct Prepared<'a> {
    centroids: &'a CentroidSet,
    transposed: Mat<f32>,
    norms: Vec<f32>,
    max_norm: f32,
    geometry: Geometry,
}

/// Upper bound on `|gemm score - scalar score|`, doubled.
#[inline]
fn slack(dim: usize, x_norm: f32, max_c_norm: f32) -> f32 {
    8.0 * (dim as f32 + 2.0) * f32::EPSILON * (x_norm + max_c_norm)
}

impl Prepared<'_> {
    fn nearest_block(&self, block: &[f32]) -> Vec<Nearest> {
        let dim = self.centroids.dim();
        let k = self.centroids.len();
        let rows = block.len() / dim;

        let x = Mat::<f32>::from_fn(rows, dim, |i, j| block[i * dim + j]);
        let products: Mat<f32> = x.as_ref() * self.transposed.as_ref();

        let mut out = Vec::with_capacity(rows);
        for i in 0..rows {
            let v = &block[i * dim..(i + 1) * dim];
            let x_norm = norm_squared(v);
            let score = |j: usize| match self.geometry {
                Geometry::L2 => x_norm - 2.0 * products[(i, j)] + self.norms[j],
                Geometry::Dot => -products[(i, j)],
            };

            let mut block_min = f32::INFINITY;
            for j in 0..k {
                let s = score(j);
                if s < block_min {
                    block_min = s;
                }
            }
            let cutoff = block_min + slack(dim, x_norm, self.max_norm);

            let mut best: Option<Nearest> = None;
            for j in 0..k {
                if !(score(j) <= cutoff) {
                    continue;
                }
                let d = distance(v, self.centroids.centroid(j), self.geometry);
                if best.map_or(true, |b| d < b.distance) {
                    best = Some(Nearest {
                        id: j as u32,
                        distance: d,
                    });
                }
            }
            // Non-finite block scores leave no candidates; score directly.
            out.push(best.unwrap_or_else(|| nearest_one(v, self.centroids, self.geometry)));
        }
        out
    }
}

impl BatchDistanceComputer for MatrixComputer {
    fn name(&self) -> &'static str {
        "matrix"
    }

    fn nearest(
        &self,
        vectors: &[f32],
        centroids: &CentroidSet,
        geometry: Geometry,
    ) -> Result<Vec<Nearest>> {
        check_input(vectors, centroids)?;
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let dim = centroids.dim();
        let norms = centroids.norms_squared();
        let max_norm = norms.iter().copied().fold(0.0f32, f32::max);
        let prepared = Prepared {
            centroids,
            transposed: Mat::<f32>::from_fn(dim, centroids.len(), |i, j| {
                centroids.centroid(j)[i]
            }),
            norms,
            max_norm,
            geometry,
        };

        let blocks: Vec<Vec<Nearest>> = vectors
            .par_chunks(self.block_rows * dim)
            .map(|block| prepared.nearest_block(block))
            .collect();
        Ok(blocks.concat())
    }
}
