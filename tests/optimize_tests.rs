mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::assertions::{dataset_row_ids, indexed_row_ids, snapshot};
use common::harness::{test_config, TestHarness};
use common::vectors::{append_rows, create_dataset, COLUMN};

use quiver::cancel::Cancellation;
use quiver::dataset::Dataset;
use quiver::error::QuiverError;
use quiver::index::{CreateIndexRequest, IndexBuilder, IndexContext, IndexStore};
use quiver::optimize::IndexOptimizer;
use quiver::storage::QuiverStore;

const DIM: usize = 32;

fn context(threshold: usize) -> Arc<IndexContext> {
    let mut config = test_config();
    config.optimize.max_deltas_before_compact = threshold;
    IndexContext::new(config)
}

async fn indexed_dataset(
    ctx: &Arc<IndexContext>,
    store: &QuiverStore,
    uri: &str,
    rows: usize,
) -> Dataset {
    let mut dataset = create_dataset(store, uri, rows, DIM).await;
    IndexBuilder::new(Arc::clone(ctx))
        .create_index(
            &mut dataset,
            &CreateIndexRequest::new(COLUMN)
                .num_partitions(16)
                .num_sub_vectors(8)
                .num_bits(8)
                .replace(true),
            &Cancellation::none(),
        )
        .await
        .unwrap();
    dataset
}

fn assert_exact_cover(indexed: &[u64], dataset: &Dataset) {
    let unique: BTreeSet<u64> = indexed.iter().copied().collect();
    assert_eq!(unique.len(), indexed.len(), "duplicate row ids in index");
    assert_eq!(unique, dataset_row_ids(dataset), "index and dataset rows differ");
}

#[tokio::test]
async fn test_small_appends_then_single_optimize() {
    let harness = TestHarness::new();
    let store = &harness.store;
    let ctx = context(4);
    let mut dataset = indexed_dataset(&ctx, store, "opt-appends", 1000).await;

    for i in 0..5 {
        append_rows(store, "opt-appends", 2400, DIM, 10 + i).await;
    }
    let summaries = IndexOptimizer::new(Arc::clone(&ctx))
        .optimize_indices(&mut dataset, &Cancellation::none())
        .await
        .unwrap();

    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.rows_merged, 12_000);
    assert_eq!(summary.delta_count, 1);
    assert!(!summary.compacted);

    let index_ref = dataset.index_ref(COLUMN).unwrap();
    assert_eq!(index_ref.main.num_rows, 1000);
    assert_eq!(index_ref.deltas[0].num_rows, 12_000);
    assert_eq!(index_ref.deltas[0].fragment_ids, vec![1, 2, 3, 4, 5]);
    assert!(dataset.unindexed_fragments(COLUMN).is_empty());

    let ids = indexed_row_ids(store, &dataset, COLUMN).await;
    assert_exact_cover(&ids, &dataset);
}

#[tokio::test]
async fn test_threshold_triggers_compaction() {
    let harness = TestHarness::new();
    let store = &harness.store;
    let ctx = context(3);
    let optimizer = IndexOptimizer::new(Arc::clone(&ctx));
    let mut dataset = indexed_dataset(&ctx, store, "opt-threshold", 500).await;
    let first_main = dataset.index_ref(COLUMN).unwrap().main.clone();

    let mut delta_ids = Vec::new();
    for round in 0..3u64 {
        append_rows(store, "opt-threshold", 100, DIM, 20 + round).await;
        let summary = optimizer
            .optimize_column(&mut dataset, COLUMN, &Cancellation::none())
            .await
            .unwrap();
        assert_eq!(summary.delta_count, round as usize + 1);
        assert!(!summary.compacted);
        delta_ids.push(dataset.index_ref(COLUMN).unwrap().deltas[round as usize].id.clone());
    }

    append_rows(store, "opt-threshold", 100, DIM, 99).await;
    let summary = optimizer
        .optimize_column(&mut dataset, COLUMN, &Cancellation::none())
        .await
        .unwrap();
    assert!(summary.compacted);
    assert_eq!(summary.delta_count, 0);
    assert_eq!(summary.rows_merged, 100);

    let index_ref = dataset.index_ref(COLUMN).unwrap();
    assert!(index_ref.deltas.is_empty());
    assert_ne!(index_ref.main.id, first_main.id);
    assert_eq!(index_ref.main.num_rows, 900);
    assert_eq!(index_ref.main.fragment_ids, vec![0, 1, 2, 3, 4]);

    let index_store = IndexStore::new(store.clone(), dataset.uri(), COLUMN);
    for old in std::iter::once(&first_main.id).chain(delta_ids.iter()) {
        assert!(store
            .list_prefix(&index_store.segment_prefix(old))
            .await
            .unwrap()
            .is_empty());
    }

    let ids = indexed_row_ids(store, &dataset, COLUMN).await;
    assert_exact_cover(&ids, &dataset);
}

#[tokio::test]
async fn test_optimize_without_new_rows_is_a_no_op() {
    let harness = TestHarness::new();
    let store = &harness.store;
    let ctx = context(4);
    let optimizer = IndexOptimizer::new(Arc::clone(&ctx));
    let mut dataset = indexed_dataset(&ctx, store, "opt-idempotent", 400).await;
    append_rows(store, "opt-idempotent", 50, DIM, 3).await;
    optimizer
        .optimize_indices(&mut dataset, &Cancellation::none())
        .await
        .unwrap();

    let before = snapshot(store, "opt-idempotent").await;
    let version = dataset.version();
    let summaries = optimizer
        .optimize_indices(&mut dataset, &Cancellation::none())
        .await
        .unwrap();
    assert_eq!(summaries[0].rows_merged, 0);
    assert_eq!(dataset.version(), version);
    assert_eq!(snapshot(store, "opt-idempotent").await, before);
}

#[tokio::test]
async fn test_forced_compaction_merges_existing_deltas() {
    let harness = TestHarness::new();
    let store = &harness.store;
    let ctx = context(10);
    let optimizer = IndexOptimizer::new(Arc::clone(&ctx));
    let mut dataset = indexed_dataset(&ctx, store, "opt-forced", 300).await;
    for seed in 0..2 {
        append_rows(store, "opt-forced", 40, DIM, 50 + seed).await;
        optimizer
            .optimize_column(&mut dataset, COLUMN, &Cancellation::none())
            .await
            .unwrap();
    }
    assert_eq!(dataset.index_ref(COLUMN).unwrap().deltas.len(), 2);
    let version = dataset.index_ref(COLUMN).unwrap().version;

    let summary = optimizer.compact(&mut dataset, COLUMN).await.unwrap();
    assert!(summary.compacted);
    assert_eq!(summary.rows_merged, 0);
    assert_eq!(summary.version, version + 1);

    let index_ref = dataset.index_ref(COLUMN).unwrap();
    assert!(index_ref.deltas.is_empty());
    assert_eq!(index_ref.main.num_rows, 380);
    let ids = indexed_row_ids(store, &dataset, COLUMN).await;
    assert_exact_cover(&ids, &dataset);

    // nothing left to compact
    let again = optimizer.compact(&mut dataset, COLUMN).await.unwrap();
    assert!(!again.compacted);
    assert_eq!(again.version, summary.version);
}

#[tokio::test]
async fn test_cancelled_optimize_leaves_index_untouched() {
    let harness = TestHarness::new();
    let store = &harness.store;
    let ctx = context(4);
    let mut dataset = indexed_dataset(&ctx, store, "opt-cancel", 300).await;
    append_rows(store, "opt-cancel", 60, DIM, 4).await;
    dataset.checkout_latest().await.unwrap();
    let before = dataset.index_ref(COLUMN).cloned();

    let (tx, cancel) = Cancellation::channel();
    tx.send(true).unwrap();
    let err = IndexOptimizer::new(Arc::clone(&ctx))
        .optimize_column(&mut dataset, COLUMN, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, QuiverError::Cancelled));
    assert_eq!(dataset.index_ref(COLUMN).cloned(), before);
    assert_eq!(dataset.unindexed_fragments(COLUMN).len(), 1);
}

#[tokio::test]
async fn test_optimize_requires_index() {
    let harness = TestHarness::new();
    let store = &harness.store;
    let mut dataset = create_dataset(store, "opt-missing", 100, DIM).await;
    let err = IndexOptimizer::new(context(4))
        .optimize_column(&mut dataset, COLUMN, &Cancellation::none())
        .await
        .unwrap_err();
    assert!(matches!(err, QuiverError::IndexNotFound { .. }));

    // a dataset without indices has nothing to optimize
    let summaries = IndexOptimizer::new(context(4))
        .optimize_indices(&mut dataset, &Cancellation::none())
        .await
        .unwrap();
    assert!(summaries.is_empty());
}

#[tokio::test]
async fn test_optimizer_reloads_model_without_cache() {
    let harness = TestHarness::new();
    let store = &harness.store;
    let build_ctx = context(4);
    let mut dataset = indexed_dataset(&build_ctx, store, "opt-cold", 300).await;
    append_rows(store, "opt-cold", 25, DIM, 8).await;

    // fresh context: model must come from the store
    let cold = context(4);
    assert!(cold.cache.is_empty());
    let summary = IndexOptimizer::new(Arc::clone(&cold))
        .optimize_column(&mut dataset, COLUMN, &Cancellation::none())
        .await
        .unwrap();
    assert_eq!(summary.rows_merged, 25);
    assert_eq!(cold.cache.len(), 1);
}
