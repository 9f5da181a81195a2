//! k-means++ initialization and Lloyd's iteration.
//!
//! Membership is kept as flat arrays (row -> cluster, cluster -> count);
//! centroid sums are accumulated per cluster over its members in row order,
//! so the result depends only on the input rows and the seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::error::{QuiverError, Result};
use crate::index::assign::BatchDistanceComputer;
use crate::index::centroids::CentroidSet;
use crate::index::distance::{normalize_in_place, squared_l2};
use crate::types::Geometry;

/// Rows per task when updating seeding distances.
pub const SEEDING_CHUNK_ROWS: usize = 1024;

#[derive(Debug, Clone)]
pub struct KMeansParams {
    pub k: usize,
    pub max_iterations: usize,
    /// Convergence threshold on the maximum squared centroid shift.
    pub tolerance: f64,
    pub geometry: Geometry,
    /// Project centroids back onto the unit sphere after every update.
    pub normalize_centroids: bool,
    pub seed: u64,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct KMeansResult {
    pub centroids: CentroidSet,
    pub iterations: usize,
    pub converged: bool,
    /// Sum of row-to-centroid distances at the last assignment.
    pub inertia: f64,
    pub reseeded: usize,
}

/// Lloyd's k-means over a flat row-major sample.
pub struct KMeans<'a> {
    params: KMeansParams,
    computer: &'a dyn BatchDistanceComputer,
}

impl<'a> KMeans<'a> {
    pub fn new(params: KMeansParams, computer: &'a dyn BatchDistanceComputer) -> Self {
        Self { params, computer }
    }

    /// Train `k` centroids on `data` (`dim` columns).
    ///
    /// Fails with `InsufficientData` when there are fewer rows than `k`.
    pub fn train(&self, data: &[f32], dim: usize, cancel: &Cancellation) -> Result<KMeansResult> {
        let k = self.params.k;
        if dim == 0 || data.len() % dim != 0 {
            return Err(QuiverError::DimensionMismatch {
                expected: dim,
                actual: if dim == 0 { 0 } else { data.len() % dim },
            });
        }
        if k == 0 {
            return Err(QuiverError::InvalidConfig("k must be > 0".into()));
        }
        let n = data.len() / dim;
        if n < k {
            return Err(QuiverError::InsufficientData {
                required: k,
                available: n,
            });
        }

        info!(n, k, dim, computer = self.computer.name(), "starting k-means++ initialization");
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let mut centroids = self.init_plus_plus(data, dim, &mut rng)?;

        let mut assignments = vec![0u32; n];
        let mut dists = vec![0f32; n];
        let mut reseeded = 0usize;
        let mut inertia = 0f64;

        for iter in 0..self.params.max_iterations {
            cancel.check()?;

            let nearest = self.computer.nearest(data, &centroids, self.params.geometry)?;
            for (i, nst) in nearest.into_iter().enumerate() {
                assignments[i] = nst.id;
                dists[i] = nst.distance;
            }

            let mut counts = vec![0usize; k];
            for &a in &assignments {
                counts[a as usize] += 1;
            }
            reseeded += reseed_empty(&mut assignments, &mut dists, &mut counts);
            inertia = dists.iter().map(|&d| d as f64).sum();

            let updated = self.update(data, dim, &assignments, &counts, &centroids)?;
            let max_shift = centroids
                .iter()
                .zip(updated.iter())
                .map(|(a, b)| squared_l2(a, b) as f64)
                .fold(0.0f64, f64::max);
            centroids = updated;

            debug!(
                iter = iter + 1,
                max_shift,
                inertia,
                "k-means iteration complete"
            );

            if max_shift <= self.params.tolerance {
                info!(iterations = iter + 1, max_shift, inertia, "k-means converged");
                return Ok(KMeansResult {
                    centroids,
                    iterations: iter + 1,
                    converged: true,
                    inertia,
                    reseeded,
                });
            }
        }

        warn!(
            max_iterations = self.params.max_iterations,
            "k-means did not converge within iteration limit, using current centroids"
        );
        Ok(KMeansResult {
            centroids,
            iterations: self.params.max_iterations,
            converged: false,
            inertia,
            reseeded,
        })
    }

    /// k-means++ seeding: each new centroid is drawn with probability
    /// proportional to the squared distance from the nearest chosen one.
    fn init_plus_plus(&self, data: &[f32], dim: usize, rng: &mut StdRng) -> Result<CentroidSet> {
        let n = data.len() / dim;
        let k = self.params.k;
        let chunk = self.params.chunk_size.max(1) * dim;

        let mut chosen: Vec<usize> = Vec::with_capacity(k);
        chosen.push(rng.gen_range(0..n));
        let mut min_dists = vec![f32::INFINITY; n];

        while chosen.len() < k {
            let last = &data[chosen[chosen.len() - 1] * dim..][..dim];
            min_dists
                .par_chunks_mut(self.params.chunk_size.max(1))
                .zip(data.par_chunks(chunk))
                .for_each(|(mins, rows)| {
                    for (m, row) in mins.iter_mut().zip(rows.chunks_exact(dim)) {
                        // Seeding spreads by squared L2 under every geometry.
                        let d = squared_l2(row, last);
                        if d < *m {
                            *m = d;
                        }
                    }
                });
            let total: f64 = min_dists.iter().map(|&d| d as f64).sum();

            let next = if total > 0.0 && total.is_finite() {
                let threshold = rng.gen::<f64>() * total;
                let mut cumulative = 0f64;
                let mut pick = n - 1;
                for (i, &d) in min_dists.iter().enumerate() {
                    cumulative += d as f64;
                    if cumulative >= threshold && d > 0.0 {
                        pick = i;
                        break;
                    }
                }
                pick
            } else {
                // Remaining points coincide with chosen centroids.
                warn!(
                    chosen = chosen.len(),
                    k, "all remaining seeding distances are zero, picking uniformly"
                );
                rng.gen_range(0..n)
            };
            chosen.push(next);
        }

        let mut values = Vec::with_capacity(k * dim);
        for &i in &chosen {
            values.extend_from_slice(&data[i * dim..(i + 1) * dim]);
        }
        let mut set = CentroidSet::new(dim, values)?;
        if self.params.normalize_centroids {
            for c in 0..k {
                normalize_in_place(set.centroid_mut(c));
            }
        }
        Ok(set)
    }

    /// Mean of each cluster's members, summed in f64 in row order.
    fn update(
        &self,
        data: &[f32],
        dim: usize,
        assignments: &[u32],
        counts: &[usize],
        previous: &CentroidSet,
    ) -> Result<CentroidSet> {
        let k = counts.len();
        let mut members: Vec<Vec<u32>> = counts.iter().map(|&c| Vec::with_capacity(c)).collect();
        for (row, &a) in assignments.iter().enumerate() {
            members[a as usize].push(row as u32);
        }

        let means: Vec<Vec<f32>> = members
            .par_iter()
            .enumerate()
            .map(|(c, rows)| {
                if rows.is_empty() {
                    return previous.centroid(c).to_vec();
                }
                let mut sum = vec![0f64; dim];
                for &r in rows {
                    let row = &data[r as usize * dim..(r as usize + 1) * dim];
                    for (s, &v) in sum.iter_mut().zip(row) {
                        *s += v as f64;
                    }
                }
                let inv = 1.0 / rows.len() as f64;
                let mut mean: Vec<f32> = sum.into_iter().map(|s| (s * inv) as f32).collect();
                if self.params.normalize_centroids {
                    normalize_in_place(&mut mean);
                }
                mean
            })
            .collect();

        let mut values = Vec::with_capacity(k * dim);
        for m in means {
            values.extend(m);
        }
        CentroidSet::new(dim, values)
    }
}

/// Give every empty cluster one member: the row farthest from its own
/// centroid among clusters holding more than one row. Returns the number of
/// clusters reseeded.
fn reseed_empty(assignments: &mut [u32], dists: &mut [f32], counts: &mut [usize]) -> usize {
    let mut reseeded = 0;
    for empty in 0..counts.len() {
        if counts[empty] != 0 {
            continue;
        }
        let mut donor: Option<usize> = None;
        for (row, &a) in assignments.iter().enumerate() {
            if counts[a as usize] <= 1 {
                continue;
            }
            match donor {
                Some(best) if dists[row] <= dists[best] => {}
                _ => donor = Some(row),
            }
        }
        let Some(row) = donor else {
            // No cluster can spare a row (n == number of non-empty clusters).
            break;
        };
        let from = assignments[row] as usize;
        counts[from] -= 1;
        counts[empty] += 1;
        assignments[row] = empty as u32;
        dists[row] = 0.0;
        reseeded += 1;
        debug!(cluster = empty, donor = from, row, "reseeded empty cluster");
    }
    reseeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::assign::ReferenceComputer;

    fn params(k: usize) -> KMeansParams {
        KMeansParams {
            k,
            max_iterations: 50,
            tolerance: 1e-6,
            geometry: Geometry::L2,
            normalize_centroids: false,
            seed: 42,
            chunk_size: 16,
        }
    }

    #[test]
    fn test_train_converges_on_separated_clusters() {
        let mut data = Vec::new();
        for i in 0..50 {
            data.extend_from_slice(&[i as f32 * 0.01, 0.0]);
        }
        for i in 0..50 {
            data.extend_from_slice(&[10.0 + i as f32 * 0.01, 0.0]);
        }
        let computer = ReferenceComputer::new(8);
        let result = KMeans::new(params(2), &computer)
            .train(&data, 2, &Cancellation::none())
            .unwrap();

        assert_eq!(result.centroids.len(), 2);
        let c0 = result.centroids.centroid(0)[0].min(result.centroids.centroid(1)[0]);
        let c1 = result.centroids.centroid(0)[0].max(result.centroids.centroid(1)[0]);
        assert!((c0 - 0.245).abs() < 1e-3, "lower centroid {c0}");
        assert!((c1 - 10.245).abs() < 1e-3, "upper centroid {c1}");
        assert!(result.converged);
    }

    #[test]
    fn test_fewer_rows_than_k() {
        let computer = ReferenceComputer::new(8);
        match KMeans::new(params(5), &computer).train(&[1.0, 0.0, 0.0, 1.0], 2, &Cancellation::none()) {
            Err(QuiverError::InsufficientData {
                required,
                available,
            }) => {
                assert_eq!(required, 5);
                assert_eq!(available, 2);
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }
    }

    #[test]
    fn test_same_seed_same_centroids() {
        let mut rng = StdRng::seed_from_u64(9);
        let data: Vec<f32> = (0..400 * 4).map(|_| rng.gen()).collect();
        let computer = ReferenceComputer::new(32);
        let a = KMeans::new(params(6), &computer)
            .train(&data, 4, &Cancellation::none())
            .unwrap();
        let other = ReferenceComputer::new(5);
        let b = KMeans::new(params(6), &other)
            .train(&data, 4, &Cancellation::none())
            .unwrap();
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn test_k_equals_n_no_empty_clusters() {
        let data = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let computer = ReferenceComputer::new(2);
        let result = KMeans::new(params(4), &computer)
            .train(&data, 2, &Cancellation::none())
            .unwrap();
        let nearest = computer
            .nearest(&data, &result.centroids, Geometry::L2)
            .unwrap();
        let mut seen: Vec<u32> = nearest.iter().map(|n| n.id).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_reseed_moves_farthest_row() {
        let mut assignments = vec![0, 0, 0, 1];
        let mut dists = vec![0.1, 0.9, 0.5, 0.0];
        let mut counts = vec![3, 1, 0];
        assert_eq!(reseed_empty(&mut assignments, &mut dists, &mut counts), 1);
        assert_eq!(assignments, vec![0, 2, 0, 1]);
        assert_eq!(counts, vec![2, 1, 1]);
    }

    #[test]
    fn test_cancelled_before_first_iteration() {
        let (tx, cancel) = Cancellation::channel();
        tx.send(true).unwrap();
        let computer = ReferenceComputer::new(8);
        let data = vec![0.0, 1.0, 2.0, 3.0];
        assert!(matches!(
            KMeans::new(params(2), &computer).train(&data, 1, &cancel),
            Err(QuiverError::Cancelled)
        ));
    }

    #[test]
    fn test_normalized_centroids_have_unit_norm() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut data: Vec<f32> = (0..200 * 3).map(|_| rng.gen::<f32>() - 0.5).collect();
        crate::index::distance::normalize_rows(&mut data, 3);
        let mut p = params(4);
        p.geometry = Geometry::Dot;
        p.normalize_centroids = true;
        let computer = ReferenceComputer::new(8);
        let result = KMeans::new(p, &computer)
            .train(&data, 3, &Cancellation::none())
            .unwrap();
        for c in result.centroids.iter() {
            let norm = crate::index::distance::norm_squared(c).sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }
}
