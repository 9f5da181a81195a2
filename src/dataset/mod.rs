//! Append-only vector dataset over the object store.
//!
//! ```text
//! {uri}/_manifest.bin          DatasetManifest, CAS-updated
//! {uri}/data/{id}.frag         immutable fragments
//! {uri}/_indices/{column}/     index artifacts
//! ```

pub mod fragment;
pub mod manifest;
pub mod source;

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, instrument, warn};

use crate::error::{QuiverError, Result};
use crate::storage::QuiverStore;
use crate::types::VectorBatch;

pub use fragment::{DataFragment, FragmentColumn};
pub use manifest::{
    ColumnSchema, DatasetManifest, FragmentMeta, IndexRef, ManifestVersion, SegmentRef,
};
pub use source::{BatchSource, DatasetScanner, ScanFilter, VectorSource};

/// Maximum CAS retry attempts for manifest updates.
const MAX_CAS_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `DatasetExists` if the dataset is already there.
    Create,
    Append,
    /// Replace every fragment and drop all indices.
    Overwrite,
}

/// Named fixed-dimension float columns with equal row counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorTable {
    columns: Vec<FragmentColumn>,
    num_rows: usize,
}

impl VectorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column of row-major values.
    pub fn with_column(mut self, name: impl Into<String>, dim: usize, values: Vec<f32>) -> Result<Self> {
        let name = name.into();
        if dim == 0 || values.len() % dim != 0 {
            return Err(QuiverError::DimensionMismatch {
                expected: dim,
                actual: if dim == 0 { 0 } else { values.len() % dim },
            });
        }
        let rows = values.len() / dim;
        if !self.columns.is_empty() && rows != self.num_rows {
            return Err(QuiverError::InvalidConfig(format!(
                "column {name} has {rows} rows, table has {}",
                self.num_rows
            )));
        }
        if self.columns.iter().any(|c| c.name == name) {
            return Err(QuiverError::InvalidConfig(format!("duplicate column {name}")));
        }
        self.num_rows = rows;
        self.columns.push(FragmentColumn { name, dim, values });
        Ok(self)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn columns(&self) -> &[FragmentColumn] {
        &self.columns
    }

    pub fn schema(&self) -> Vec<ColumnSchema> {
        self.columns
            .iter()
            .map(|c| ColumnSchema {
                name: c.name.clone(),
                dim: c.dim,
            })
            .collect()
    }

    fn check_schema(&self, schema: &[ColumnSchema]) -> Result<()> {
        for col in schema {
            let ours = self
                .columns
                .iter()
                .find(|c| c.name == col.name)
                .ok_or_else(|| QuiverError::ColumnNotFound {
                    column: col.name.clone(),
                })?;
            if ours.dim != col.dim {
                return Err(QuiverError::DimensionMismatch {
                    expected: col.dim,
                    actual: ours.dim,
                });
            }
        }
        if self.columns.len() != schema.len() {
            return Err(QuiverError::InvalidConfig(
                "appended table has columns the dataset does not".into(),
            ));
        }
        Ok(())
    }
}

/// A handle on one version of a dataset.
#[derive(Clone)]
pub struct Dataset {
    store: QuiverStore,
    uri: String,
    manifest: DatasetManifest,
    etag: ManifestVersion,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("uri", &self.uri)
            .field("version", &self.manifest.version)
            .finish()
    }
}

impl Dataset {
    /// Write `table` under `uri` and return a handle on the new version.
    #[instrument(skip(store, table), fields(uri = uri, rows = table.num_rows()))]
    pub async fn write(
        store: &QuiverStore,
        uri: &str,
        table: &VectorTable,
        mode: WriteMode,
    ) -> Result<Self> {
        if table.num_rows() == 0 {
            return Err(QuiverError::InvalidConfig("cannot write an empty table".into()));
        }
        let existing = DatasetManifest::read_versioned(store, uri).await?;
        match (mode, &existing) {
            (WriteMode::Create, Some(_)) => {
                return Err(QuiverError::DatasetExists {
                    uri: uri.to_string(),
                })
            }
            (WriteMode::Append, None) => {
                return Err(QuiverError::DatasetNotFound {
                    uri: uri.to_string(),
                })
            }
            (WriteMode::Append, Some((manifest, _))) => table.check_schema(&manifest.schema)?,
            _ => {}
        }

        let start_id = existing.as_ref().map_or(0, |(m, _)| m.next_fragment_id);
        let fragment_id = claim_fragment(store, uri, table, start_id).await?;
        let fragment = FragmentMeta {
            id: fragment_id,
            num_rows: table.num_rows(),
        };

        let mut current = existing;
        for attempt in 0..MAX_CAS_RETRIES {
            let (next, version, dropped) = match current.take() {
                Some((mut manifest, version)) => {
                    let dropped = match mode {
                        WriteMode::Append => {
                            table.check_schema(&manifest.schema)?;
                            Vec::new()
                        }
                        WriteMode::Create => {
                            return Err(QuiverError::DatasetExists {
                                uri: uri.to_string(),
                            })
                        }
                        WriteMode::Overwrite => {
                            manifest.schema = table.schema();
                            manifest.indices.clear();
                            std::mem::take(&mut manifest.fragments)
                        }
                    };
                    manifest.fragments.push(fragment.clone());
                    manifest.next_fragment_id =
                        manifest.next_fragment_id.max(fragment_id.saturating_add(1));
                    manifest.bump();
                    (manifest, version, dropped)
                }
                None => {
                    if mode == WriteMode::Append {
                        return Err(QuiverError::DatasetNotFound {
                            uri: uri.to_string(),
                        });
                    }
                    let mut manifest = DatasetManifest::new(table.schema());
                    manifest.fragments.push(fragment.clone());
                    manifest.next_fragment_id = fragment_id.saturating_add(1);
                    manifest.bump();
                    (manifest, ManifestVersion(None), Vec::new())
                }
            };

            match next.write_conditional(store, uri, &version).await {
                Ok(()) => {
                    info!(
                        version = next.version,
                        fragment_id,
                        mode = ?mode,
                        attempt,
                        "committed dataset write"
                    );
                    if mode == WriteMode::Overwrite {
                        cleanup_overwritten(store, uri, &dropped).await;
                    }
                    return Self::open(store, uri).await;
                }
                Err(QuiverError::ManifestConflict { .. }) => {
                    warn!(attempt, uri, "manifest CAS conflict in dataset write, retrying");
                    current = DatasetManifest::read_versioned(store, uri).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(QuiverError::ManifestConflict {
            uri: uri.to_string(),
        })
    }

    pub async fn open(store: &QuiverStore, uri: &str) -> Result<Self> {
        let (manifest, etag) = DatasetManifest::read_versioned(store, uri)
            .await?
            .ok_or_else(|| QuiverError::DatasetNotFound {
                uri: uri.to_string(),
            })?;
        Ok(Self {
            store: store.clone(),
            uri: uri.to_string(),
            manifest,
            etag,
        })
    }

    /// Refresh this handle to the latest committed version.
    pub async fn checkout_latest(&mut self) -> Result<()> {
        let latest = Self::open(&self.store, &self.uri).await?;
        self.manifest = latest.manifest;
        self.etag = latest.etag;
        Ok(())
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn store(&self) -> &QuiverStore {
        &self.store
    }

    pub fn manifest(&self) -> &DatasetManifest {
        &self.manifest
    }

    pub fn version(&self) -> u64 {
        self.manifest.version
    }

    pub fn count_rows(&self) -> usize {
        self.manifest.num_rows()
    }

    pub fn schema(&self) -> &[ColumnSchema] {
        &self.manifest.schema
    }

    pub fn fragments(&self) -> &[FragmentMeta] {
        &self.manifest.fragments
    }

    pub fn index_ref(&self, column: &str) -> Option<&IndexRef> {
        self.manifest.index(column)
    }

    pub fn column_dim(&self, column: &str) -> Result<usize> {
        self.manifest
            .column_dim(column)
            .ok_or_else(|| QuiverError::ColumnNotFound {
                column: column.to_string(),
            })
    }

    /// Fragments not covered by the column's current index, in write order.
    pub fn unindexed_fragments(&self, column: &str) -> Vec<FragmentMeta> {
        let covered = self
            .index_ref(column)
            .map(IndexRef::covered_fragments)
            .unwrap_or_default();
        self.manifest
            .fragments
            .iter()
            .filter(|f| !covered.contains(&f.id))
            .cloned()
            .collect()
    }

    pub fn scan(&self, column: &str, filter: ScanFilter, batch_size: usize) -> Result<DatasetScanner> {
        let dim = self.column_dim(column)?;
        let fragments = match filter {
            ScanFilter::All => self.manifest.fragments.clone(),
            ScanFilter::Unindexed => self.unindexed_fragments(column),
        };
        DatasetScanner::new(self.store.clone(), &self.uri, column, dim, fragments, batch_size)
    }

    /// `n` rows drawn uniformly without replacement, in row order.
    /// Returns every row when `n >= count_rows()`.
    #[instrument(skip(self), fields(uri = %self.uri))]
    pub async fn sample(&self, column: &str, n: usize, seed: u64) -> Result<VectorBatch> {
        let total = self.count_rows();
        if n >= total {
            return self.scan(column, ScanFilter::All, total.max(1))?.read_all().await;
        }
        let dim = self.column_dim(column)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut picks = rand::seq::index::sample(&mut rng, total, n).into_vec();
        picks.sort_unstable();

        // Global row index -> (fragment position, offset).
        let mut by_fragment: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut frag = 0usize;
        let mut base = 0usize;
        for idx in picks {
            while idx >= base + self.manifest.fragments[frag].num_rows {
                base += self.manifest.fragments[frag].num_rows;
                frag += 1;
            }
            by_fragment.entry(frag).or_default().push(idx - base);
        }

        let loaded = futures::future::try_join_all(by_fragment.keys().map(|&pos| {
            let id = self.manifest.fragments[pos].id;
            let store = self.store.clone();
            let key = DataFragment::key(&self.uri, id);
            async move { DataFragment::from_bytes(&store.get(&key).await?) }
        }))
        .await?;

        let mut out = VectorBatch::empty(dim);
        for (fragment, offsets) in loaded.iter().zip(by_fragment.values()) {
            let batch = fragment.batch(column)?;
            for &offset in offsets {
                out.row_ids.push(batch.row_ids[offset]);
                out.values.extend_from_slice(batch.row(offset));
            }
        }
        debug!(requested = n, total, "sampled rows");
        Ok(out)
    }

    /// Apply `f` to the latest manifest and commit it with CAS, retrying on
    /// conflict. `f` may run more than once; an error from it aborts.
    #[instrument(skip(self, f), fields(uri = %self.uri))]
    pub async fn update_manifest<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut DatasetManifest) -> Result<()>,
    {
        for attempt in 0..MAX_CAS_RETRIES {
            let Some((mut manifest, version)) =
                DatasetManifest::read_versioned(&self.store, &self.uri).await?
            else {
                return Err(QuiverError::DatasetNotFound {
                    uri: self.uri.clone(),
                });
            };
            f(&mut manifest)?;
            manifest.bump();
            match manifest.write_conditional(&self.store, &self.uri, &version).await {
                Ok(()) => {
                    debug!(version = manifest.version, attempt, "updated manifest");
                    return self.checkout_latest().await;
                }
                Err(QuiverError::ManifestConflict { .. }) => {
                    warn!(attempt, uri = %self.uri, "manifest CAS conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(QuiverError::ManifestConflict {
            uri: self.uri.clone(),
        })
    }
}

/// Write the table as a new fragment at the first free id from `start`.
async fn claim_fragment(
    store: &QuiverStore,
    uri: &str,
    table: &VectorTable,
    start: u32,
) -> Result<u32> {
    let mut id = start;
    loop {
        let fragment = DataFragment {
            id,
            num_rows: table.num_rows(),
            columns: table.columns().to_vec(),
        };
        if store
            .put_if_not_exists(&DataFragment::key(uri, id), fragment.to_bytes())
            .await?
        {
            return Ok(id);
        }
        id = id.checked_add(1).ok_or_else(|| {
            QuiverError::InvalidConfig("fragment id space exhausted".into())
        })?;
    }
}

/// Best-effort removal of fragments and indices replaced by an overwrite.
async fn cleanup_overwritten(store: &QuiverStore, uri: &str, dropped: &[FragmentMeta]) {
    for meta in dropped {
        if let Err(e) = store.delete(&DataFragment::key(uri, meta.id)).await {
            warn!(fragment_id = meta.id, error = %e, "failed to delete overwritten fragment");
        }
    }
    if let Err(e) = store.delete_prefix(&format!("{uri}/_indices")).await {
        warn!(error = %e, "failed to delete indices of overwritten dataset");
    }
}
