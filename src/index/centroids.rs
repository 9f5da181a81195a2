//! Flat, dense centroid storage.
//!
//! Centroid `i` lives at `data[i * dim..(i + 1) * dim]`; the position is the
//! partition (or code) identity.
//!
//! ## Binary format
//!
//! ```text
//! [num_centroids: u32][dim: u32]
//! [f32 * dim] * num_centroids        (little-endian, bit-exact)
//! ```

use crate::codec::{put_f32s, put_u32, Reader};
use crate::error::{QuiverError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct CentroidSet {
    dim: usize,
    data: Vec<f32>,
}

impl CentroidSet {
    pub fn new(dim: usize, data: Vec<f32>) -> Result<Self> {
        if dim == 0 {
            return Err(QuiverError::InvalidConfig(
                "centroid dimension must be > 0".into(),
            ));
        }
        if data.len() % dim != 0 {
            return Err(QuiverError::DimensionMismatch {
                expected: dim,
                actual: data.len() % dim,
            });
        }
        Ok(Self { dim, data })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn centroid(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn centroid_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dim)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Squared norm of every centroid, in id order.
    pub fn norms_squared(&self) -> Vec<f32> {
        self.iter().map(super::distance::norm_squared).collect()
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        8 + self.data.len() * 4
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.len() as u32);
        put_u32(buf, self.dim as u32);
        put_f32s(buf, &self.data);
    }

    /// Parse a centroid set at the reader's position.
    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self> {
        let num = reader.u32()? as usize;
        let dim = reader.u32()? as usize;
        if dim == 0 {
            return Err(reader.malformed("centroid dim is zero"));
        }
        let count = num
            .checked_mul(dim)
            .ok_or_else(|| reader.malformed("centroid header overflow"))?;
        let data = reader.f32s(count)?;
        Ok(Self { dim, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BlobKind;

    #[test]
    fn test_round_trip_is_bit_exact() {
        let values = vec![1.5, -0.0, f32::MIN_POSITIVE, 3.0e-39, 7.25, f32::MAX];
        let set = CentroidSet::new(3, values.clone()).unwrap();
        let mut buf = Vec::new();
        set.write_to(&mut buf);
        assert_eq!(buf.len(), set.encoded_len());

        let mut reader = Reader::new(&buf, BlobKind::Index);
        let decoded = CentroidSet::read_from(&mut reader).unwrap();
        reader.finish().unwrap();
        assert_eq!(decoded.len(), 2);
        let bits: Vec<u32> = decoded.as_slice().iter().map(|v| v.to_bits()).collect();
        let orig: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, orig);
    }

    #[test]
    fn test_truncated_blob_is_corrupt() {
        let set = CentroidSet::new(2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut buf = Vec::new();
        set.write_to(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            CentroidSet::read_from(&mut Reader::new(&buf, BlobKind::Index)),
            Err(QuiverError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_rejects_ragged_data() {
        assert!(CentroidSet::new(3, vec![1.0, 2.0]).is_err());
    }
}
