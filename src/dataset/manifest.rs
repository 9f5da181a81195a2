use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};
use crate::index::params::IndexParams;
use crate::storage::QuiverStore;

/// Version byte for manifest format detection.
const MANIFEST_FORMAT_MSGPACK: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub dim: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMeta {
    pub id: u32,
    pub num_rows: usize,
}

/// A reference to an encoded index segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub id: String,
    pub num_rows: usize,
    /// Dataset fragments whose rows the segment holds.
    pub fragment_ids: Vec<u32>,
}

/// The logical index on one column: a main segment plus deltas, all sharing
/// one trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRef {
    pub column: String,
    pub index_id: String,
    pub model_id: String,
    pub params: IndexParams,
    pub dim: usize,
    pub main: SegmentRef,
    /// Delta segments in publish order.
    #[serde(default)]
    pub deltas: Vec<SegmentRef>,
    /// Bumped on every publish of this index.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl IndexRef {
    /// Main segment first, then deltas in publish order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentRef> {
        std::iter::once(&self.main).chain(self.deltas.iter())
    }

    pub fn covered_fragments(&self) -> BTreeSet<u32> {
        self.segments()
            .flat_map(|s| s.fragment_ids.iter().copied())
            .collect()
    }

    pub fn num_rows(&self) -> usize {
        self.segments().map(|s| s.num_rows).sum()
    }
}

/// Opaque version token (ETag) for CAS manifest writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestVersion(pub Option<String>);

/// Single source of truth for what a dataset contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    /// Monotonic, bumped on every committed write.
    pub version: u64,
    pub schema: Vec<ColumnSchema>,
    /// Live fragments in write order.
    pub fragments: Vec<FragmentMeta>,
    pub next_fragment_id: u32,
    #[serde(default)]
    pub indices: Vec<IndexRef>,
    pub updated_at: DateTime<Utc>,
}

impl DatasetManifest {
    pub fn new(schema: Vec<ColumnSchema>) -> Self {
        Self {
            version: 0,
            schema,
            fragments: Vec::new(),
            next_fragment_id: 0,
            indices: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn key(uri: &str) -> String {
        format!("{uri}/_manifest.bin")
    }

    pub fn num_rows(&self) -> usize {
        self.fragments.iter().map(|f| f.num_rows).sum()
    }

    pub fn column_dim(&self, column: &str) -> Option<usize> {
        self.schema.iter().find(|c| c.name == column).map(|c| c.dim)
    }

    pub fn index(&self, column: &str) -> Option<&IndexRef> {
        self.indices.iter().find(|i| i.column == column)
    }

    /// Insert or replace the index on `index_ref.column`.
    pub fn set_index(&mut self, index_ref: IndexRef) {
        match self.indices.iter_mut().find(|i| i.column == index_ref.column) {
            Some(slot) => *slot = index_ref,
            None => self.indices.push(index_ref),
        }
    }

    pub fn remove_index(&mut self, column: &str) -> Option<IndexRef> {
        let pos = self.indices.iter().position(|i| i.column == column)?;
        Some(self.indices.remove(pos))
    }

    /// Record a committed change.
    pub fn bump(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Serialize to MessagePack bytes with a version header.
    ///
    /// Format: `[0x01] [msgpack payload]`
    pub fn to_bytes(&self) -> Result<Bytes> {
        let msgpack = rmp_serde::to_vec(self)?;
        let mut data = Vec::with_capacity(1 + msgpack.len());
        data.push(MANIFEST_FORMAT_MSGPACK);
        data.extend_from_slice(&msgpack);
        Ok(Bytes::from(data))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        match data.first() {
            Some(&MANIFEST_FORMAT_MSGPACK) => rmp_serde::from_slice(&data[1..]).map_err(|e| {
                QuiverError::Serialization(format!("manifest msgpack deserialize: {e}"))
            }),
            Some(other) => Err(QuiverError::Serialization(format!(
                "unknown manifest format {other:#04x}"
            ))),
            None => Err(QuiverError::Serialization("empty manifest".into())),
        }
    }

    /// Read the manifest along with its ETag. Returns None if not found.
    pub async fn read_versioned(
        store: &QuiverStore,
        uri: &str,
    ) -> Result<Option<(Self, ManifestVersion)>> {
        match store.get_with_meta(&Self::key(uri)).await {
            Ok((data, etag)) => Ok(Some((Self::from_bytes(&data)?, ManifestVersion(etag)))),
            Err(QuiverError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write with CAS when the version carries an ETag; create-only otherwise.
    pub async fn write_conditional(
        &self,
        store: &QuiverStore,
        uri: &str,
        version: &ManifestVersion,
    ) -> Result<()> {
        let key = Self::key(uri);
        let data = self.to_bytes()?;
        match &version.0 {
            Some(etag) => store.put_if_match(&key, data, etag, uri).await,
            None => {
                if store.put_if_not_exists(&key, data).await? {
                    Ok(())
                } else {
                    Err(QuiverError::ManifestConflict {
                        uri: uri.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;

    fn index_ref(column: &str) -> IndexRef {
        IndexRef {
            column: column.into(),
            index_id: "i1".into(),
            model_id: "m1".into(),
            params: IndexParams::from_config(&IndexingConfig::default()),
            dim: 4,
            main: SegmentRef {
                id: "s1".into(),
                num_rows: 10,
                fragment_ids: vec![0, 1],
            },
            deltas: vec![SegmentRef {
                id: "s2".into(),
                num_rows: 3,
                fragment_ids: vec![2],
            }],
            version: 2,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_round_trip() {
        let mut manifest = DatasetManifest::new(vec![ColumnSchema {
            name: "vector".into(),
            dim: 4,
        }]);
        manifest.fragments.push(FragmentMeta { id: 0, num_rows: 5 });
        manifest.set_index(index_ref("vector"));
        let decoded = DatasetManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_covered_fragments_union() {
        let r = index_ref("vector");
        assert_eq!(r.covered_fragments().into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(r.num_rows(), 13);
    }

    #[test]
    fn test_set_index_replaces() {
        let mut manifest = DatasetManifest::new(Vec::new());
        manifest.set_index(index_ref("vector"));
        let mut newer = index_ref("vector");
        newer.model_id = "m2".into();
        manifest.set_index(newer);
        assert_eq!(manifest.indices.len(), 1);
        assert_eq!(manifest.index("vector").unwrap().model_id, "m2");
        assert!(manifest.remove_index("vector").is_some());
        assert!(manifest.index("vector").is_none());
    }

    #[tokio::test]
    async fn test_create_only_write_conflicts() {
        let store = QuiverStore::in_memory();
        let manifest = DatasetManifest::new(Vec::new());
        let none = ManifestVersion(None);
        manifest.write_conditional(&store, "ds", &none).await.unwrap();
        assert!(matches!(
            manifest.write_conditional(&store, "ds", &none).await,
            Err(QuiverError::ManifestConflict { .. })
        ));
        let (read, version) = DatasetManifest::read_versioned(&store, "ds")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, manifest);
        read.write_conditional(&store, "ds", &version).await.unwrap();
    }
}
