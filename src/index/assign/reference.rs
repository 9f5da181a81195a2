use rayon::prelude::*;

use super::{check_input, BatchDistanceComputer, Nearest};
use crate::error::Result;
use crate::index::centroids::CentroidSet;
use crate::index::distance::distance;
use crate::types::Geometry;

/// Direct per-pair scoring on the rayon pool, `chunk_size` rows per task.
#[derive(Debug, Clone)]
pub struct ReferenceComputer {
    chunk_size: usize,
}

impl ReferenceComputer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

/// Closest centroid for a single vector. Strict `<` keeps the lowest id on ties.
#[inline]
pub fn nearest_one(vector: &[f32], centroids: &CentroidSet, geometry: Geometry) -> Nearest {
    let mut best = Nearest {
        id: 0,
        distance: f32::INFINITY,
    };
    for (id, centroid) in centroids.iter().enumerate() {
        let d = distance(vector, centroid, geometry);
        if d < best.distance {
            best = Nearest {
                id: id as u32,
                distance: d,
            };
        }
    }
    best
}

impl BatchDistanceComputer for ReferenceComputer {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn nearest(
        &self,
        vectors: &[f32],
        centroids: &CentroidSet,
        geometry: Geometry,
    ) -> Result<Vec<Nearest>> {
        check_input(vectors, centroids)?;
        let dim = centroids.dim();
        let chunks: Vec<Vec<Nearest>> = vectors
            .par_chunks(self.chunk_size * dim)
            .map(|chunk| {
                chunk
                    .chunks_exact(dim)
                    .map(|v| nearest_one(v, centroids, geometry))
                    .collect()
            })
            .collect();
        Ok(chunks.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_id_wins_ties() {
        // Centroids 1 and 2 are identical; row sits on both.
        let centroids = CentroidSet::new(2, vec![5.0, 5.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        let got = ReferenceComputer::new(4)
            .nearest(&[1.0, 1.0], &centroids, Geometry::L2)
            .unwrap();
        assert_eq!(got[0].id, 1);
        assert_eq!(got[0].distance, 0.0);
    }

    #[test]
    fn test_chunking_preserves_row_order() {
        let centroids = CentroidSet::new(1, vec![0.0, 10.0, 20.0]).unwrap();
        let rows: Vec<f32> = (0..25).map(|i| i as f32).collect();
        let got = ReferenceComputer::new(3)
            .nearest(&rows, &centroids, Geometry::L2)
            .unwrap();
        let ids: Vec<u32> = got.iter().map(|n| n.id).collect();
        let expected: Vec<u32> = (0..25)
            .map(|i: u32| match i {
                0..=5 => 0,
                6..=15 => 1,
                _ => 2,
            })
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_dot_geometry_prefers_aligned() {
        let centroids = CentroidSet::new(2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let got = ReferenceComputer::new(8)
            .nearest(&[0.1, 0.9], &centroids, Geometry::Dot)
            .unwrap();
        assert_eq!(got[0].id, 1);
    }
}
