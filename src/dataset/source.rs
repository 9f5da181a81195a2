use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::debug;

use crate::dataset::fragment::DataFragment;
use crate::dataset::manifest::FragmentMeta;
use crate::error::{QuiverError, Result};
use crate::storage::QuiverStore;
use crate::types::VectorBatch;

/// Which rows a scan returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    All,
    /// Rows in fragments not yet covered by the column's index.
    Unindexed,
}

/// Fixed-dimension vectors read in batches.
#[async_trait]
pub trait VectorSource: Send {
    fn dim(&self) -> usize;

    /// Total rows the source will yield.
    fn num_rows(&self) -> usize;

    /// Next batch of at most the configured size, `None` when exhausted.
    async fn next_batch(&mut self) -> Result<Option<VectorBatch>>;

    /// Drain the remaining rows into one batch.
    async fn read_all(&mut self) -> Result<VectorBatch> {
        let mut all = VectorBatch::empty(self.dim());
        while let Some(batch) = self.next_batch().await? {
            all.extend(&batch)?;
        }
        Ok(all)
    }
}

/// Append rows `[offset, offset + n)` of `src` to `out`.
fn copy_rows(src: &VectorBatch, offset: usize, n: usize, out: &mut VectorBatch) {
    let dim = src.dim;
    out.row_ids.extend_from_slice(&src.row_ids[offset..offset + n]);
    out.values
        .extend_from_slice(&src.values[offset * dim..(offset + n) * dim]);
}

/// Slice the next batch out of `batch` starting at `*offset`.
fn take_at(batch: &VectorBatch, offset: &mut usize, batch_size: usize) -> VectorBatch {
    let n = batch_size.min(batch.len() - *offset);
    let mut out = VectorBatch {
        dim: batch.dim,
        row_ids: Vec::with_capacity(n),
        values: Vec::with_capacity(n * batch.dim),
    };
    copy_rows(batch, *offset, n, &mut out);
    *offset += n;
    out
}

/// Streams one column from a list of dataset fragments.
///
/// Batches span fragment boundaries; every batch but the last holds exactly
/// `batch_size` rows.
pub struct DatasetScanner {
    store: QuiverStore,
    uri: String,
    column: String,
    dim: usize,
    batch_size: usize,
    fragment_ids: Vec<u32>,
    pending: VecDeque<FragmentMeta>,
    /// Current fragment's rows and the first row not yet returned.
    current: VectorBatch,
    offset: usize,
    num_rows: usize,
}

impl DatasetScanner {
    pub(crate) fn new(
        store: QuiverStore,
        uri: &str,
        column: &str,
        dim: usize,
        fragments: Vec<FragmentMeta>,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(QuiverError::InvalidConfig("scan batch size must be > 0".into()));
        }
        let num_rows = fragments.iter().map(|f| f.num_rows).sum();
        Ok(Self {
            store,
            uri: uri.to_string(),
            column: column.to_string(),
            dim,
            batch_size,
            fragment_ids: fragments.iter().map(|f| f.id).collect(),
            pending: fragments.into(),
            current: VectorBatch::empty(dim),
            offset: 0,
            num_rows,
        })
    }

    /// Fragments this scan covers, in scan order.
    pub fn fragment_ids(&self) -> &[u32] {
        &self.fragment_ids
    }
}

#[async_trait]
impl VectorSource for DatasetScanner {
    fn dim(&self) -> usize {
        self.dim
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    async fn next_batch(&mut self) -> Result<Option<VectorBatch>> {
        let mut out = VectorBatch::empty(self.dim);
        while out.len() < self.batch_size {
            if self.offset == self.current.len() {
                let Some(meta) = self.pending.pop_front() else {
                    break;
                };
                self.current = self.load_fragment(&meta).await?;
                self.offset = 0;
                continue;
            }
            let n = (self.batch_size - out.len()).min(self.current.len() - self.offset);
            copy_rows(&self.current, self.offset, n, &mut out);
            self.offset += n;
        }
        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(out))
    }
}

impl DatasetScanner {
    async fn load_fragment(&self, meta: &FragmentMeta) -> Result<VectorBatch> {
        let data = self
            .store
            .get(&DataFragment::key(&self.uri, meta.id))
            .await?;
        let fragment = DataFragment::from_bytes(&data)?;
        let batch = fragment.batch(&self.column)?;
        if batch.dim != self.dim {
            return Err(QuiverError::DimensionMismatch {
                expected: self.dim,
                actual: batch.dim,
            });
        }
        debug!(fragment_id = meta.id, rows = batch.len(), "scanned fragment");
        Ok(batch)
    }
}

/// An in-memory batch served in fixed-size slices.
pub struct BatchSource {
    batch: VectorBatch,
    offset: usize,
    batch_size: usize,
    num_rows: usize,
}

impl BatchSource {
    pub fn new(batch: VectorBatch, batch_size: usize) -> Self {
        let num_rows = batch.len();
        Self {
            batch,
            offset: 0,
            batch_size: batch_size.max(1),
            num_rows,
        }
    }
}

#[async_trait]
impl VectorSource for BatchSource {
    fn dim(&self) -> usize {
        self.batch.dim
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    async fn next_batch(&mut self) -> Result<Option<VectorBatch>> {
        if self.offset == self.batch.len() {
            return Ok(None);
        }
        Ok(Some(take_at(&self.batch, &mut self.offset, self.batch_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_source_slices() {
        let batch = VectorBatch::try_new(1, (0..5).collect(), vec![0.0, 1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let mut source = BatchSource::new(batch, 2);
        assert_eq!(source.num_rows(), 5);
        let first = source.next_batch().await.unwrap().unwrap();
        assert_eq!(first.row_ids, vec![0, 1]);
        let rest = source.read_all().await.unwrap();
        assert_eq!(rest.row_ids, vec![2, 3, 4]);
        assert_eq!(rest.values, vec![2.0, 3.0, 4.0]);
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_source_exact_multiple() {
        let batch = VectorBatch::try_new(2, (0..4).collect(), (0..8).map(|v| v as f32).collect())
            .unwrap();
        let mut source = BatchSource::new(batch, 2);
        let second = {
            source.next_batch().await.unwrap();
            source.next_batch().await.unwrap().unwrap()
        };
        assert_eq!(second.row_ids, vec![2, 3]);
        assert_eq!(second.values, vec![4.0, 5.0, 6.0, 7.0]);
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(DatasetScanner::new(QuiverStore::in_memory(), "ds", "v", 2, Vec::new(), 0).is_err());
    }
}
