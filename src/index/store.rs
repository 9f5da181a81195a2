//! Durable layout of one column's index under `{uri}/_indices/{column}/`.
//!
//! ```text
//! models/{model_id}/ivf.bin               IVF centroids
//! models/{model_id}/pq.bin                PQ codebooks
//! segments/{segment_id}/metadata.bin      SegmentMetadata (msgpack)
//! segments/{segment_id}/partition_{i}.bin posting list of partition i
//! ```
//!
//! Models and segments are immutable once written; the dataset manifest
//! decides which of them are live.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{QuiverError, Result};
use crate::index::ivf::IvfModel;
use crate::index::posting::PostingList;
use crate::index::pq::ProductQuantizer;
use crate::storage::QuiverStore;

const SEGMENT_METADATA_FORMAT_MSGPACK: u8 = 0x01;

/// Trained IVF centroids and PQ codebooks shared by every segment of an index.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub model_id: String,
    pub ivf: IvfModel,
    pub pq: ProductQuantizer,
}

/// Description of one encoded segment (the main index or a delta).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub segment_id: String,
    pub model_id: String,
    pub num_partitions: usize,
    pub num_sub_vectors: usize,
    pub num_bits: u8,
    pub dim: usize,
    pub num_rows: usize,
    pub partition_sizes: Vec<usize>,
    pub has_vectors: bool,
    /// Dataset fragments whose rows this segment encodes.
    pub fragment_ids: Vec<u32>,
    pub created_at: DateTime<Utc>,
}

impl SegmentMetadata {
    pub fn to_bytes(&self) -> Result<Bytes> {
        let msgpack = rmp_serde::to_vec(self)?;
        let mut data = Vec::with_capacity(1 + msgpack.len());
        data.push(SEGMENT_METADATA_FORMAT_MSGPACK);
        data.extend_from_slice(&msgpack);
        Ok(Bytes::from(data))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        match data.first() {
            Some(&SEGMENT_METADATA_FORMAT_MSGPACK) => rmp_serde::from_slice(&data[1..])
                .map_err(|e| QuiverError::CorruptIndex(format!("segment metadata: {e}"))),
            Some(other) => Err(QuiverError::CorruptIndex(format!(
                "unknown segment metadata format {other:#04x}"
            ))),
            None => Err(QuiverError::CorruptIndex("empty segment metadata".into())),
        }
    }
}

/// A segment with all of its posting lists loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub metadata: SegmentMetadata,
    pub partitions: Vec<PostingList>,
}

impl Segment {
    pub fn num_rows(&self) -> usize {
        self.partitions.iter().map(PostingList::len).sum()
    }
}

#[derive(Clone)]
pub struct IndexStore {
    store: QuiverStore,
    root: String,
}

impl IndexStore {
    pub fn new(store: QuiverStore, uri: &str, column: &str) -> Self {
        Self {
            store,
            root: format!("{uri}/_indices/{column}"),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn model_prefix(&self, model_id: &str) -> String {
        format!("{}/models/{model_id}", self.root)
    }

    pub fn ivf_key(&self, model_id: &str) -> String {
        format!("{}/ivf.bin", self.model_prefix(model_id))
    }

    pub fn pq_key(&self, model_id: &str) -> String {
        format!("{}/pq.bin", self.model_prefix(model_id))
    }

    pub fn segment_prefix(&self, segment_id: &str) -> String {
        format!("{}/segments/{segment_id}", self.root)
    }

    pub fn metadata_key(&self, segment_id: &str) -> String {
        format!("{}/metadata.bin", self.segment_prefix(segment_id))
    }

    pub fn partition_key(&self, segment_id: &str, partition: usize) -> String {
        format!("{}/partition_{partition}.bin", self.segment_prefix(segment_id))
    }

    #[instrument(skip(self, ivf, pq), fields(root = %self.root))]
    pub async fn write_model(
        &self,
        model_id: &str,
        ivf: &IvfModel,
        pq: &ProductQuantizer,
    ) -> Result<()> {
        let results = futures::future::join_all([
            self.store.put(&self.ivf_key(model_id), ivf.to_bytes()),
            self.store.put(&self.pq_key(model_id), pq.to_bytes()),
        ])
        .await;
        for result in results {
            result?;
        }
        debug!(model_id, partitions = ivf.num_partitions(), "wrote index model");
        Ok(())
    }

    /// Load only the IVF centroids of a model.
    pub async fn load_ivf(&self, model_id: &str) -> Result<IvfModel> {
        let data = self.store.get(&self.ivf_key(model_id)).await?;
        IvfModel::from_bytes(&data)
    }

    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn load_model(&self, model_id: &str) -> Result<LoadedModel> {
        let (ivf, pq) = futures::future::try_join(
            self.store.get(&self.ivf_key(model_id)),
            self.store.get(&self.pq_key(model_id)),
        )
        .await?;
        let ivf = IvfModel::from_bytes(&ivf)?;
        let pq = ProductQuantizer::from_bytes(&pq)?;
        if ivf.dim() != pq.dim() {
            return Err(QuiverError::CorruptIndex(format!(
                "model {model_id}: IVF dim {} != PQ dim {}",
                ivf.dim(),
                pq.dim()
            )));
        }
        Ok(LoadedModel {
            model_id: model_id.to_string(),
            ivf,
            pq,
        })
    }

    /// Write every posting list, then the metadata object last.
    ///
    /// On failure the blobs already written under the segment prefix are
    /// removed before the error is returned.
    #[instrument(skip(self, metadata, partitions), fields(root = %self.root, segment_id = %metadata.segment_id))]
    pub async fn write_segment(
        &self,
        metadata: &SegmentMetadata,
        partitions: &[PostingList],
    ) -> Result<()> {
        if partitions.len() != metadata.num_partitions {
            return Err(QuiverError::CorruptIndex(format!(
                "segment {} declares {} partitions, got {}",
                metadata.segment_id,
                metadata.num_partitions,
                partitions.len()
            )));
        }
        if let Err(e) = self.put_segment(metadata, partitions).await {
            if let Err(cleanup) = self.delete_segment(&metadata.segment_id).await {
                warn!(error = %cleanup, "failed to remove partial segment");
            }
            return Err(e);
        }
        debug!(
            rows = metadata.num_rows,
            partitions = metadata.num_partitions,
            "wrote index segment"
        );
        Ok(())
    }

    async fn put_segment(&self, metadata: &SegmentMetadata, partitions: &[PostingList]) -> Result<()> {
        let payloads: Vec<(String, Bytes)> = partitions
            .iter()
            .enumerate()
            .map(|(i, list)| (self.partition_key(&metadata.segment_id, i), list.to_bytes()))
            .collect();
        let results = futures::future::join_all(
            payloads
                .iter()
                .map(|(key, data)| self.store.put(key, data.clone())),
        )
        .await;
        for result in results {
            result?;
        }
        self.store
            .put(&self.metadata_key(&metadata.segment_id), metadata.to_bytes()?)
            .await
    }

    pub async fn load_segment_metadata(&self, segment_id: &str) -> Result<SegmentMetadata> {
        let data = self.store.get(&self.metadata_key(segment_id)).await?;
        SegmentMetadata::from_bytes(&data)
    }

    pub async fn load_partition(&self, segment_id: &str, partition: usize) -> Result<PostingList> {
        let data = self
            .store
            .get(&self.partition_key(segment_id, partition))
            .await?;
        PostingList::from_bytes(&data)
    }

    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn load_segment(&self, segment_id: &str) -> Result<Segment> {
        let metadata = self.load_segment_metadata(segment_id).await?;
        let partitions = futures::future::try_join_all(
            (0..metadata.num_partitions).map(|i| self.load_partition(segment_id, i)),
        )
        .await?;
        for (i, (list, &expected)) in partitions.iter().zip(&metadata.partition_sizes).enumerate() {
            if list.len() != expected {
                return Err(QuiverError::CorruptIndex(format!(
                    "segment {segment_id} partition {i}: expected {expected} rows, found {}",
                    list.len()
                )));
            }
        }
        Ok(Segment {
            metadata,
            partitions,
        })
    }

    pub async fn delete_model(&self, model_id: &str) -> Result<usize> {
        self.store.delete_prefix(&self.model_prefix(model_id)).await
    }

    pub async fn delete_segment(&self, segment_id: &str) -> Result<usize> {
        self.store
            .delete_prefix(&self.segment_prefix(segment_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::centroids::CentroidSet;
    use crate::index::pq::CodeWidth;
    use crate::index::posting::PostingShape;
    use crate::types::DistanceMetric;
    use futures::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
        PutMultipartOpts, PutOptions, PutPayload, PutResult,
    };
    use std::sync::Arc;

    /// In-memory store whose puts fail for keys containing `fail_on`.
    #[derive(Debug)]
    struct FailingPuts {
        inner: InMemory,
        fail_on: &'static str,
    }

    impl std::fmt::Display for FailingPuts {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FailingPuts({})", self.fail_on)
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for FailingPuts {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            if location.as_ref().contains(self.fail_on) {
                return Err(object_store::Error::Generic {
                    store: "failing",
                    source: "injected put failure".into(),
                });
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &Path,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&Path>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    fn failing_index(fail_on: &'static str) -> (QuiverStore, IndexStore) {
        let store = QuiverStore::new(Arc::new(FailingPuts {
            inner: InMemory::new(),
            fail_on,
        }));
        let index = IndexStore::new(store.clone(), "ds", "vector");
        (store, index)
    }

    fn metadata(segment_id: &str, sizes: Vec<usize>) -> SegmentMetadata {
        SegmentMetadata {
            segment_id: segment_id.to_string(),
            model_id: "m1".into(),
            num_partitions: sizes.len(),
            num_sub_vectors: 1,
            num_bits: 4,
            dim: 2,
            num_rows: sizes.iter().sum(),
            partition_sizes: sizes,
            has_vectors: false,
            fragment_ids: vec![0, 1],
            created_at: Utc::now(),
        }
    }

    fn shape() -> PostingShape {
        PostingShape {
            num_sub_vectors: 1,
            dim: 2,
            code_width: CodeWidth::U8,
            has_vectors: false,
        }
    }

    #[tokio::test]
    async fn test_segment_round_trip_and_partial_reads() {
        let index = IndexStore::new(QuiverStore::in_memory(), "ds", "vector");
        let mut p0 = PostingList::new(shape());
        p0.push(1, &[3], None).unwrap();
        let p1 = PostingList::new(shape());
        let meta = metadata("s1", vec![1, 0]);
        index.write_segment(&meta, &[p0.clone(), p1]).await.unwrap();

        assert_eq!(index.load_segment_metadata("s1").await.unwrap(), meta);
        assert_eq!(index.load_partition("s1", 0).await.unwrap(), p0);
        let segment = index.load_segment("s1").await.unwrap();
        assert_eq!(segment.num_rows(), 1);
        assert!(segment.partitions[1].is_empty());

        assert_eq!(index.delete_segment("s1").await.unwrap(), 3);
        assert!(matches!(
            index.load_segment_metadata("s1").await,
            Err(QuiverError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_partition_write_removes_partial_segment() {
        let (store, index) = failing_index("partition_2");
        let lists: Vec<PostingList> = (0..4).map(|_| PostingList::new(shape())).collect();
        let meta = metadata("s1", vec![0; 4]);

        assert!(index.write_segment(&meta, &lists).await.is_err());
        assert!(store
            .list_prefix(&format!("{}/segments", index.root()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_metadata_write_removes_partitions() {
        let (store, index) = failing_index("metadata.bin");
        let meta = metadata("s1", vec![0, 0]);
        let lists = [PostingList::new(shape()), PostingList::new(shape())];

        assert!(index.write_segment(&meta, &lists).await.is_err());
        assert!(store
            .list_prefix(&index.segment_prefix("s1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_partition_count_checked() {
        let index = IndexStore::new(QuiverStore::in_memory(), "ds", "vector");
        let meta = metadata("s1", vec![0, 0]);
        assert!(index
            .write_segment(&meta, &[PostingList::new(shape())])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_partition_size_mismatch_is_corrupt() {
        let index = IndexStore::new(QuiverStore::in_memory(), "ds", "vector");
        let meta = metadata("s1", vec![2]);
        let mut list = PostingList::new(shape());
        list.push(1, &[3], None).unwrap();
        index.write_segment(&meta, &[list]).await.unwrap();
        assert!(matches!(
            index.load_segment("s1").await,
            Err(QuiverError::CorruptIndex(_))
        ));
    }

    #[tokio::test]
    async fn test_load_ivf_only() {
        let index = IndexStore::new(QuiverStore::in_memory(), "ds", "vector");
        let ivf = IvfModel::new(
            DistanceMetric::L2,
            CentroidSet::new(2, vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        index
            .store
            .put(&index.ivf_key("m1"), ivf.to_bytes())
            .await
            .unwrap();
        assert_eq!(index.load_ivf("m1").await.unwrap(), ivf);
        // No codebooks were written, so the full model is unavailable.
        assert!(index.load_model("m1").await.is_err());
    }

    #[test]
    fn test_metadata_bad_header() {
        let mut bytes = metadata("s1", vec![1]).to_bytes().unwrap().to_vec();
        bytes[0] = 0x7F;
        assert!(matches!(
            SegmentMetadata::from_bytes(&bytes),
            Err(QuiverError::CorruptIndex(_))
        ));
    }
}
