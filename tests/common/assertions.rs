use std::collections::BTreeSet;

use quiver::dataset::Dataset;
use quiver::index::IndexStore;
use quiver::storage::QuiverStore;
use quiver::types::RowId;

/// Every row id of every segment of the column's index, in storage order.
pub async fn indexed_row_ids(store: &QuiverStore, dataset: &Dataset, column: &str) -> Vec<RowId> {
    let index_ref = dataset.index_ref(column).expect("index present");
    let index_store = IndexStore::new(store.clone(), dataset.uri(), column);
    let mut ids = Vec::new();
    for segment in index_ref.segments() {
        let loaded = index_store.load_segment(&segment.id).await.unwrap();
        for list in &loaded.partitions {
            ids.extend_from_slice(list.row_ids());
        }
    }
    ids
}

/// Row ids the dataset currently holds.
pub fn dataset_row_ids(dataset: &Dataset) -> BTreeSet<RowId> {
    dataset
        .fragments()
        .iter()
        .flat_map(|f| (0..f.num_rows as u32).map(move |o| quiver::types::row_address(f.id, o)))
        .collect()
}

/// Snapshot of every object under `prefix`, for byte-level comparisons.
pub async fn snapshot(store: &QuiverStore, prefix: &str) -> Vec<(String, bytes::Bytes)> {
    let mut out = Vec::new();
    for key in store.list_prefix(prefix).await.unwrap() {
        let data = store.get(&key).await.unwrap();
        out.push((key, data));
    }
    out
}
