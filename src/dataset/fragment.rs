use bytes::Bytes;

use crate::codec::{put_f32s, put_string, put_u32, put_u64, seal, unseal, BlobKind, Reader};
use crate::error::{QuiverError, Result};
use crate::types::{row_address, VectorBatch};

/// Magic bytes identifying a data fragment.
const FRAGMENT_MAGIC: &[u8; 4] = b"QVFG";
const FRAGMENT_FORMAT_VERSION: u8 = 1;

/// One fixed-dimension float column inside a fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentColumn {
    pub name: String,
    pub dim: usize,
    pub values: Vec<f32>,
}

/// An immutable slice of dataset rows.
///
/// Layout:
/// `[magic][version][id: u32][num_rows: u64][num_columns: u32]`
/// then per column `[name][dim: u32][f32 * num_rows * dim]`, then the xxh3
/// trailer.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFragment {
    pub id: u32,
    pub num_rows: usize,
    pub columns: Vec<FragmentColumn>,
}

impl DataFragment {
    pub fn key(uri: &str, id: u32) -> String {
        format!("{uri}/data/{id}.frag")
    }

    pub fn column(&self, name: &str) -> Option<&FragmentColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The rows of one column with their row addresses.
    pub fn batch(&self, column: &str) -> Result<VectorBatch> {
        let col = self.column(column).ok_or_else(|| QuiverError::ColumnNotFound {
            column: column.to_string(),
        })?;
        let row_ids = (0..self.num_rows as u32)
            .map(|offset| row_address(self.id, offset))
            .collect();
        VectorBatch::try_new(col.dim, row_ids, col.values.clone())
    }

    pub fn to_bytes(&self) -> Bytes {
        let payload: usize = self
            .columns
            .iter()
            .map(|c| 8 + c.name.len() + c.values.len() * 4)
            .sum();
        let mut buf = Vec::with_capacity(21 + payload + 8);
        buf.extend_from_slice(FRAGMENT_MAGIC);
        buf.push(FRAGMENT_FORMAT_VERSION);
        put_u32(&mut buf, self.id);
        put_u64(&mut buf, self.num_rows as u64);
        put_u32(&mut buf, self.columns.len() as u32);
        for col in &self.columns {
            put_string(&mut buf, &col.name);
            put_u32(&mut buf, col.dim as u32);
            put_f32s(&mut buf, &col.values);
        }
        seal(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let payload = unseal(data, BlobKind::Fragment)?;
        let mut reader = Reader::new(payload, BlobKind::Fragment);
        reader.expect_magic(FRAGMENT_MAGIC)?;
        let version = reader.u8()?;
        if version != FRAGMENT_FORMAT_VERSION {
            return Err(reader.malformed(format!("unsupported fragment version {version}")));
        }
        let id = reader.u32()?;
        let num_rows = reader.u64()? as usize;
        let num_columns = reader.u32()? as usize;
        let mut columns = Vec::with_capacity(num_columns.min(64));
        for _ in 0..num_columns {
            let name = reader.string()?;
            let dim = reader.u32()? as usize;
            let count = num_rows
                .checked_mul(dim)
                .ok_or_else(|| reader.malformed("column size overflow"))?;
            let values = reader.f32s(count)?;
            columns.push(FragmentColumn { name, dim, values });
        }
        reader.finish()?;
        Ok(Self {
            id,
            num_rows,
            columns,
        })
    }
}
