//! Per-partition posting lists of `(row id, PQ code, optional vector)`.
//!
//! ## Binary format (`partition_{i}.bin`)
//!
//! ```text
//! [magic "QPST"][version: u8]
//! [num_rows: u64][num_sub_vectors: u32][code_width: u8][has_vectors: u8][dim: u32]
//! [row_id: u64] * num_rows
//! [code: u8 | u16] * (num_rows * num_sub_vectors)
//! [f32 * dim] * num_rows                 (only when has_vectors = 1)
//! [xxh3: u64]
//! ```

use bytes::Bytes;

use crate::codec::{put_f32s, put_u32, put_u64, seal, unseal, BlobKind, Reader};
use crate::error::{QuiverError, Result};
use crate::index::pq::CodeWidth;
use crate::types::RowId;

const POSTING_MAGIC: &[u8; 4] = b"QPST";
const POSTING_FORMAT_VERSION: u8 = 1;

/// Shape shared by every posting list of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingShape {
    pub num_sub_vectors: usize,
    pub dim: usize,
    pub code_width: CodeWidth,
    pub has_vectors: bool,
}

/// Borrowed view of one posting entry.
#[derive(Debug, Clone, Copy)]
pub struct PostingEntry<'a> {
    pub row_id: RowId,
    pub code: &'a [u16],
    pub vector: Option<&'a [f32]>,
}

/// Entries of one IVF partition in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct PostingList {
    shape: PostingShape,
    row_ids: Vec<RowId>,
    codes: Vec<u16>,
    vectors: Option<Vec<f32>>,
}

impl PostingList {
    pub fn new(shape: PostingShape) -> Self {
        Self {
            shape,
            row_ids: Vec::new(),
            codes: Vec::new(),
            vectors: shape.has_vectors.then(Vec::new),
        }
    }

    pub fn shape(&self) -> PostingShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.row_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }

    pub fn row_ids(&self) -> &[RowId] {
        &self.row_ids
    }

    pub fn codes(&self) -> &[u16] {
        &self.codes
    }

    pub fn code(&self, i: usize) -> &[u16] {
        let m = self.shape.num_sub_vectors;
        &self.codes[i * m..(i + 1) * m]
    }

    pub fn vector(&self, i: usize) -> Option<&[f32]> {
        let dim = self.shape.dim;
        self.vectors.as_ref().map(|v| &v[i * dim..(i + 1) * dim])
    }

    pub fn entry(&self, i: usize) -> PostingEntry<'_> {
        PostingEntry {
            row_id: self.row_ids[i],
            code: self.code(i),
            vector: self.vector(i),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = PostingEntry<'_>> {
        (0..self.len()).map(move |i| self.entry(i))
    }

    /// Append one entry. The vector is required exactly when the list keeps
    /// vectors.
    pub fn push(&mut self, row_id: RowId, code: &[u16], vector: Option<&[f32]>) -> Result<()> {
        if code.len() != self.shape.num_sub_vectors {
            return Err(QuiverError::DimensionMismatch {
                expected: self.shape.num_sub_vectors,
                actual: code.len(),
            });
        }
        match (&mut self.vectors, vector) {
            (Some(store), Some(v)) => {
                if v.len() != self.shape.dim {
                    return Err(QuiverError::DimensionMismatch {
                        expected: self.shape.dim,
                        actual: v.len(),
                    });
                }
                store.extend_from_slice(v);
            }
            (None, _) => {}
            (Some(_), None) => {
                return Err(QuiverError::InvalidConfig(
                    "posting list keeps vectors but entry has none".into(),
                ));
            }
        }
        self.row_ids.push(row_id);
        self.codes.extend_from_slice(code);
        Ok(())
    }

    pub fn push_entry(&mut self, entry: PostingEntry<'_>) -> Result<()> {
        self.push(entry.row_id, entry.code, entry.vector)
    }

    /// Append every entry of `other`, which must have the same shape.
    pub fn append(&mut self, other: &PostingList) -> Result<()> {
        if other.shape != self.shape {
            return Err(QuiverError::CorruptIndex(format!(
                "posting list shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        self.row_ids.extend_from_slice(&other.row_ids);
        self.codes.extend_from_slice(&other.codes);
        if let (Some(mine), Some(theirs)) = (&mut self.vectors, &other.vectors) {
            mine.extend_from_slice(theirs);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Bytes {
        let n = self.len();
        let width = self.shape.code_width;
        let mut buf = Vec::with_capacity(
            23 + n * 8
                + self.codes.len() * width.bytes()
                + self.vectors.as_ref().map_or(0, |v| v.len() * 4)
                + 8,
        );
        buf.extend_from_slice(POSTING_MAGIC);
        buf.push(POSTING_FORMAT_VERSION);
        put_u64(&mut buf, n as u64);
        put_u32(&mut buf, self.shape.num_sub_vectors as u32);
        buf.push(match width {
            CodeWidth::U8 => 1,
            CodeWidth::U16 => 2,
        });
        buf.push(self.shape.has_vectors as u8);
        put_u32(&mut buf, self.shape.dim as u32);
        for &id in &self.row_ids {
            put_u64(&mut buf, id);
        }
        match width {
            CodeWidth::U8 => buf.extend(self.codes.iter().map(|&c| c as u8)),
            CodeWidth::U16 => {
                for &c in &self.codes {
                    buf.extend_from_slice(&c.to_le_bytes());
                }
            }
        }
        if let Some(vectors) = &self.vectors {
            put_f32s(&mut buf, vectors);
        }
        seal(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let payload = unseal(data, BlobKind::Index)?;
        let mut reader = Reader::new(payload, BlobKind::Index);
        reader.expect_magic(POSTING_MAGIC)?;
        let version = reader.u8()?;
        if version != POSTING_FORMAT_VERSION {
            return Err(QuiverError::CorruptIndex(format!(
                "unsupported posting list version {version}"
            )));
        }
        let n = reader.u64()? as usize;
        let num_sub_vectors = reader.u32()? as usize;
        let code_width = match reader.u8()? {
            1 => CodeWidth::U8,
            2 => CodeWidth::U16,
            other => {
                return Err(QuiverError::CorruptIndex(format!(
                    "invalid code width {other}"
                )))
            }
        };
        let has_vectors = reader.u8()? != 0;
        let dim = reader.u32()? as usize;

        let row_ids = reader.u64s(n)?;
        let num_codes = n
            .checked_mul(num_sub_vectors)
            .ok_or_else(|| reader.malformed("code count overflow"))?;
        let codes = match code_width {
            CodeWidth::U8 => reader.bytes(num_codes)?.iter().map(|&c| c as u16).collect(),
            CodeWidth::U16 => reader.u16s(num_codes)?,
        };
        let vectors = if has_vectors {
            let count = n
                .checked_mul(dim)
                .ok_or_else(|| reader.malformed("vector count overflow"))?;
            Some(reader.f32s(count)?)
        } else {
            None
        };
        reader.finish()?;

        Ok(Self {
            shape: PostingShape {
                num_sub_vectors,
                dim,
                code_width,
                has_vectors,
            },
            row_ids,
            codes,
            vectors,
        })
    }
}

/// Groups encoded rows into one posting list per partition.
#[derive(Debug, Clone)]
pub struct PartitionedPostings {
    lists: Vec<PostingList>,
}

impl PartitionedPostings {
    pub fn new(num_partitions: usize, shape: PostingShape) -> Self {
        Self {
            lists: (0..num_partitions).map(|_| PostingList::new(shape)).collect(),
        }
    }

    /// Wrap lists that all share one shape.
    pub fn from_lists(lists: Vec<PostingList>) -> Result<Self> {
        if let Some(first) = lists.first() {
            if lists.iter().any(|l| l.shape() != first.shape()) {
                return Err(QuiverError::CorruptIndex(
                    "posting lists of one segment differ in shape".into(),
                ));
            }
        }
        Ok(Self { lists })
    }

    /// Add rows already assigned and encoded.
    ///
    /// `codes` holds `num_sub_vectors` entries per row; `vectors` is the raw
    /// row-major input and is only read when the lists keep vectors.
    pub fn add_batch(
        &mut self,
        row_ids: &[RowId],
        partitions: &[u32],
        codes: &[u16],
        vectors: &[f32],
    ) -> Result<()> {
        let shape = match self.lists.first() {
            Some(list) => list.shape(),
            None => return Ok(()),
        };
        let m = shape.num_sub_vectors;
        if partitions.len() != row_ids.len() || codes.len() != row_ids.len() * m {
            return Err(QuiverError::DimensionMismatch {
                expected: row_ids.len() * m,
                actual: codes.len(),
            });
        }
        for (i, (&row_id, &p)) in row_ids.iter().zip(partitions).enumerate() {
            let list = self.lists.get_mut(p as usize).ok_or_else(|| {
                QuiverError::CorruptIndex(format!("partition id {p} out of range"))
            })?;
            let vector = shape
                .has_vectors
                .then(|| &vectors[i * shape.dim..(i + 1) * shape.dim]);
            list.push(row_id, &codes[i * m..(i + 1) * m], vector)?;
        }
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.lists.iter().map(PostingList::len).sum()
    }

    pub fn partition_sizes(&self) -> Vec<usize> {
        self.lists.iter().map(PostingList::len).collect()
    }

    pub fn lists(&self) -> &[PostingList] {
        &self.lists
    }

    pub fn into_lists(self) -> Vec<PostingList> {
        self.lists
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(width: CodeWidth, has_vectors: bool) -> PostingShape {
        PostingShape {
            num_sub_vectors: 2,
            dim: 4,
            code_width: width,
            has_vectors,
        }
    }

    #[test]
    fn test_round_trip_u8_codes() {
        let mut list = PostingList::new(shape(CodeWidth::U8, false));
        list.push(7, &[3, 255], None).unwrap();
        list.push(1 << 32, &[0, 9], None).unwrap();
        let decoded = PostingList::from_bytes(&list.to_bytes()).unwrap();
        assert_eq!(decoded, list);
        assert_eq!(decoded.code(0), &[3, 255]);
    }

    #[test]
    fn test_round_trip_u16_codes_with_vectors() {
        let mut list = PostingList::new(shape(CodeWidth::U16, true));
        list.push(5, &[40000, 1], Some(&[0.5, -1.0, 2.0, 1e-40])).unwrap();
        let decoded = PostingList::from_bytes(&list.to_bytes()).unwrap();
        assert_eq!(decoded.code(0), &[40000, 1]);
        let bits: Vec<u32> = decoded.vector(0).unwrap().iter().map(|v| v.to_bits()).collect();
        let orig: Vec<u32> = [0.5f32, -1.0, 2.0, 1e-40].iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, orig);
    }

    #[test]
    fn test_push_validates_shape() {
        let mut list = PostingList::new(shape(CodeWidth::U8, true));
        assert!(list.push(1, &[1], Some(&[0.0; 4])).is_err());
        assert!(list.push(1, &[1, 2], None).is_err());
        assert!(list.push(1, &[1, 2], Some(&[0.0; 3])).is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn test_partitioned_grouping_keeps_order() {
        let mut postings = PartitionedPostings::new(3, shape(CodeWidth::U8, false));
        postings
            .add_batch(&[10, 11, 12, 13], &[2, 0, 2, 2], &[1, 1, 2, 2, 3, 3, 4, 4], &[])
            .unwrap();
        assert_eq!(postings.partition_sizes(), vec![1, 0, 3]);
        assert_eq!(postings.lists()[2].row_ids(), &[10, 12, 13]);
        assert_eq!(postings.lists()[2].code(1), &[3, 3]);
        assert!(postings.add_batch(&[1], &[5], &[0, 0], &[]).is_err());
    }

    #[test]
    fn test_corrupt_list() {
        let mut list = PostingList::new(shape(CodeWidth::U8, false));
        list.push(1, &[1, 2], None).unwrap();
        let mut bytes = list.to_bytes().to_vec();
        bytes[6] ^= 0x01;
        assert!(matches!(
            PostingList::from_bytes(&bytes),
            Err(QuiverError::CorruptIndex(_))
        ));
    }
}
