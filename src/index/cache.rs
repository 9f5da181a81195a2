use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::index::store::{IndexStore, LoadedModel};

type ColumnKey = (String, String);

fn column_key(uri: &str, column: &str) -> ColumnKey {
    (uri.to_string(), column.to_string())
}

/// Published models, one per `(dataset uri, column)`.
///
/// Readers clone the `Arc` and keep using it even if a newer model is
/// published meanwhile; a publish replaces the entry as a whole.
#[derive(Default)]
pub struct IndexCache {
    entries: DashMap<ColumnKey, Arc<LoadedModel>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached model for the column, if it is `model_id`.
    pub fn get(&self, uri: &str, column: &str, model_id: &str) -> Option<Arc<LoadedModel>> {
        self.entries
            .get(&column_key(uri, column))
            .filter(|entry| entry.model_id == model_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Return the cached model or load it from `store`.
    pub async fn get_or_load(
        &self,
        uri: &str,
        column: &str,
        model_id: &str,
        store: &IndexStore,
    ) -> Result<Arc<LoadedModel>> {
        if let Some(model) = self.get(uri, column, model_id) {
            return Ok(model);
        }
        let model = Arc::new(store.load_model(model_id).await?);
        debug!(uri, column, model_id, "loaded index model into cache");
        self.insert(uri, column, Arc::clone(&model));
        Ok(model)
    }

    pub fn insert(&self, uri: &str, column: &str, model: Arc<LoadedModel>) {
        if self.entries.insert(column_key(uri, column), model).is_none() {
            crate::metrics::CACHED_MODELS.inc();
        }
    }

    pub fn invalidate(&self, uri: &str, column: &str) {
        if self.entries.remove(&column_key(uri, column)).is_some() {
            crate::metrics::CACHED_MODELS.dec();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One writer per `(dataset uri, column)`.
#[derive(Default)]
pub struct ColumnLocks {
    locks: DashMap<ColumnKey, Arc<Mutex<()>>>,
}

impl ColumnLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for a column.
    pub fn lock_for(&self, uri: &str, column: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(column_key(uri, column))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::centroids::CentroidSet;
    use crate::index::ivf::IvfModel;
    use crate::index::pq::ProductQuantizer;
    use crate::storage::QuiverStore;
    use crate::types::DistanceMetric;

    async fn store_with_model(model_id: &str) -> (IndexStore, LoadedModel) {
        use crate::cancel::Cancellation;
        use crate::config::IndexingConfig;
        use crate::index::assign::ReferenceComputer;
        use crate::index::params::IndexParams;
        use crate::types::VectorBatch;

        let mut params = IndexParams::from_config(&IndexingConfig::default());
        params.num_partitions = 2;
        params.num_sub_vectors = 1;
        params.num_bits = 2;
        params.seed = 3;
        let values: Vec<f32> = (0..40).map(|i| (i % 7) as f32).collect();
        let sample = VectorBatch::try_new(2, (0..20).collect(), values).unwrap();
        let computer = ReferenceComputer::new(8);
        let ivf = IvfModel::train(&sample, &params, &computer, &Cancellation::none()).unwrap();
        let pq =
            ProductQuantizer::train(&sample, &ivf, &params, &computer, &Cancellation::none())
                .unwrap();
        let store = IndexStore::new(QuiverStore::in_memory(), "ds", "vector");
        store.write_model(model_id, &ivf, &pq).await.unwrap();
        (
            store,
            LoadedModel {
                model_id: model_id.into(),
                ivf,
                pq,
            },
        )
    }

    #[tokio::test]
    async fn test_get_or_load_caches_by_model_id() {
        let (store, expected) = store_with_model("m1").await;
        let cache = IndexCache::new();
        assert!(cache.get("ds", "vector", "m1").is_none());

        let loaded = cache.get_or_load("ds", "vector", "m1", &store).await.unwrap();
        assert_eq!(*loaded, expected);
        let again = cache.get("ds", "vector", "m1").unwrap();
        assert!(Arc::ptr_eq(&loaded, &again));

        // A different model id misses.
        assert!(cache.get("ds", "vector", "m2").is_none());
        cache.invalidate("ds", "vector");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_keeps_old_arc_alive() {
        let cache = IndexCache::new();
        let centroids = CentroidSet::new(1, vec![0.0]).unwrap();
        let ivf = IvfModel::new(DistanceMetric::L2, centroids);
        let pq_bytes = {
            // Smallest valid quantizer: one 1-dim codebook with 2 codes.
            let mut buf = Vec::new();
            buf.extend_from_slice(b"QPQC");
            buf.extend_from_slice(&[1, 0, 1, 0]);
            crate::codec::put_u32(&mut buf, 1);
            crate::codec::put_u32(&mut buf, 1);
            CentroidSet::new(1, vec![0.0, 1.0]).unwrap().write_to(&mut buf);
            crate::codec::seal(buf)
        };
        let pq = ProductQuantizer::from_bytes(&pq_bytes).unwrap();
        let old = Arc::new(LoadedModel {
            model_id: "old".into(),
            ivf: ivf.clone(),
            pq: pq.clone(),
        });
        cache.insert("ds", "vector", Arc::clone(&old));
        let reader = cache.get("ds", "vector", "old").unwrap();

        cache.insert(
            "ds",
            "vector",
            Arc::new(LoadedModel {
                model_id: "new".into(),
                ivf,
                pq,
            }),
        );
        assert_eq!(reader.model_id, "old");
        assert!(cache.get("ds", "vector", "new").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_column_locks_are_per_column() {
        let locks = ColumnLocks::new();
        let a = locks.lock_for("ds", "a");
        let b = locks.lock_for("ds", "b");
        let _ga = a.lock().await;
        assert!(b.try_lock().is_ok());
        assert!(locks.lock_for("ds", "a").try_lock().is_err());
    }
}
