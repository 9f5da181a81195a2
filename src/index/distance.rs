//! Scalar distance kernels shared by training, assignment and encoding.
//!
//! Every path that needs an exact distance goes through these functions so
//! the reference and accelerated computers agree bit-for-bit on final scores.

use crate::types::Geometry;

/// Distance under the given geometry (lower is closer).
#[inline]
pub fn distance(a: &[f32], b: &[f32], geometry: Geometry) -> f32 {
    match geometry {
        Geometry::L2 => squared_l2(a, b),
        Geometry::Dot => -dot(a, b),
    }
}

/// Squared Euclidean distance: `sum((a_i - b_i)^2)`.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");

    // Chunks of 8 so LLVM can vectorize the inner loop.
    let chunks = a.len() / 8;
    let mut acc = [0.0f32; 8];
    for i in 0..chunks {
        let base = i * 8;
        for j in 0..8 {
            let d = a[base + j] - b[base + j];
            acc[j] += d * d;
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for i in chunks * 8..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// Inner product.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");

    let chunks = a.len() / 8;
    let mut acc = [0.0f32; 8];
    for i in 0..chunks {
        let base = i * 8;
        for j in 0..8 {
            acc[j] += a[base + j] * b[base + j];
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for i in chunks * 8..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[inline]
pub fn norm_squared(a: &[f32]) -> f32 {
    dot(a, a)
}

/// Scale `v` to unit length. Zero vectors are left untouched.
pub fn normalize_in_place(v: &mut [f32]) {
    let norm = norm_squared(v).sqrt();
    if norm > f32::EPSILON {
        let inv = 1.0 / norm;
        for x in v.iter_mut() {
            *x *= inv;
        }
    }
}

/// Normalize every `dim`-wide row of a flat buffer.
pub fn normalize_rows(values: &mut [f32], dim: usize) {
    for row in values.chunks_exact_mut(dim) {
        normalize_in_place(row);
    }
}
