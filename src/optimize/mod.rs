//! Incremental index maintenance.
//!
//! New fragments are encoded with the published model into a delta segment.
//! Once the delta count passes `max_deltas_before_compact`, main and deltas
//! are merged into a fresh main segment instead. Every change is published
//! with a manifest swap; segments it replaces are deleted only afterwards.

pub mod compaction;
pub mod state;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::cancel::Cancellation;
use crate::dataset::{Dataset, IndexRef, ScanFilter, SegmentRef};
use crate::error::{QuiverError, Result};
use crate::index::assign::select_computer;
use crate::index::builder::{encode_source, posting_shape, write_postings};
use crate::index::posting::PartitionedPostings;
use crate::index::store::{IndexStore, LoadedModel};
use crate::index::IndexContext;

pub use compaction::{merge_lists, merge_segments, MergeOutcome};
pub use state::{IndexEvent, IndexState};

/// Outcome of optimizing one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizeSummary {
    pub column: String,
    /// Newly indexed rows.
    pub rows_merged: usize,
    /// Delta segments after the pass.
    pub delta_count: usize,
    pub compacted: bool,
    /// Index version after the pass.
    pub version: u64,
}

impl OptimizeSummary {
    fn unchanged(index_ref: &IndexRef) -> Self {
        Self {
            column: index_ref.column.clone(),
            rows_merged: 0,
            delta_count: index_ref.deltas.len(),
            compacted: false,
            version: index_ref.version,
        }
    }
}

pub struct IndexOptimizer {
    ctx: Arc<IndexContext>,
}

impl IndexOptimizer {
    pub fn new(ctx: Arc<IndexContext>) -> Self {
        Self { ctx }
    }

    /// Bring every index of the dataset up to date.
    #[instrument(skip_all, fields(uri = %dataset.uri()))]
    pub async fn optimize_indices(
        &self,
        dataset: &mut Dataset,
        cancel: &Cancellation,
    ) -> Result<Vec<OptimizeSummary>> {
        dataset.checkout_latest().await?;
        let columns: Vec<String> = dataset
            .manifest()
            .indices
            .iter()
            .map(|i| i.column.clone())
            .collect();
        let mut summaries = Vec::with_capacity(columns.len());
        for column in columns {
            summaries.push(self.optimize_column(dataset, &column, cancel).await?);
        }
        Ok(summaries)
    }

    #[instrument(skip(self, dataset, cancel), fields(uri = %dataset.uri()))]
    pub async fn optimize_column(
        &self,
        dataset: &mut Dataset,
        column: &str,
        cancel: &Cancellation,
    ) -> Result<OptimizeSummary> {
        let start = Instant::now();
        let result = self.run(dataset, column, Some(cancel)).await;
        self.record("optimize_indices", column, start, &result);
        result
    }

    /// Merge existing deltas into main regardless of the threshold.
    #[instrument(skip(self, dataset), fields(uri = %dataset.uri()))]
    pub async fn compact(&self, dataset: &mut Dataset, column: &str) -> Result<OptimizeSummary> {
        let start = Instant::now();
        let result = self.run(dataset, column, None).await;
        self.record("compact", column, start, &result);
        result
    }

    fn record(
        &self,
        operation: &str,
        column: &str,
        start: Instant,
        result: &Result<OptimizeSummary>,
    ) {
        match result {
            Ok(summary) => {
                crate::metrics::OPTIMIZE_DURATION
                    .with_label_values(&[column])
                    .observe(start.elapsed().as_secs_f64());
                info!(
                    column,
                    rows_merged = summary.rows_merged,
                    delta_count = summary.delta_count,
                    compacted = summary.compacted,
                    version = summary.version,
                    elapsed_ms = start.elapsed().as_millis(),
                    "{operation} complete"
                );
            }
            Err(e) => {
                crate::metrics::INDEX_ERRORS_TOTAL
                    .with_label_values(&[operation, e.kind()])
                    .inc();
                warn!(column, error = %e, "{operation} failed");
            }
        }
    }

    /// `cancel = None` means a forced compaction with no new rows.
    async fn run(
        &self,
        dataset: &mut Dataset,
        column: &str,
        cancel: Option<&Cancellation>,
    ) -> Result<OptimizeSummary> {
        let lock = self.ctx.locks.lock_for(dataset.uri(), column);
        let _guard = lock.lock().await;
        dataset.checkout_latest().await?;

        let index_ref = dataset
            .index_ref(column)
            .cloned()
            .ok_or_else(|| QuiverError::IndexNotFound {
                column: column.to_string(),
            })?;
        let index_store = IndexStore::new(dataset.store().clone(), dataset.uri(), column);

        let Some(cancel) = cancel else {
            if index_ref.deltas.is_empty() {
                debug!(column, "no deltas to compact");
                return Ok(OptimizeSummary::unchanged(&index_ref));
            }
            let model = self.model(dataset, &index_store, &index_ref).await?;
            let state = IndexState::of(&index_ref).apply(IndexEvent::ThresholdExceeded)?;
            return self
                .compact_into_main(dataset, &index_store, &index_ref, &model, None, state, 0)
                .await;
        };

        let unindexed = dataset.unindexed_fragments(column);
        if unindexed.is_empty() {
            debug!(column, "no unindexed rows");
            return Ok(OptimizeSummary::unchanged(&index_ref));
        }

        let model = self.model(dataset, &index_store, &index_ref).await?;
        let config = &self.ctx.config;
        let computer = select_computer(
            self.ctx.default_accelerator(),
            &config.accelerator,
            config.indexing.chunk_size,
        )?;
        let mut scanner = dataset.scan(column, ScanFilter::Unindexed, config.indexing.scan_batch_size)?;
        let fragment_ids = scanner.fragment_ids().to_vec();
        let postings = encode_source(
            &mut scanner,
            &model,
            index_ref.params.store_vectors,
            &computer,
            cancel,
        )
        .await?;
        let rows_merged = postings.num_rows();
        cancel.check()?;
        crate::metrics::ROWS_INDEXED_TOTAL
            .with_label_values(&[column, "delta"])
            .inc_by(rows_merged as u64);

        let state = IndexState::of(&index_ref).apply(IndexEvent::Append)?;
        let threshold = config.optimize.max_deltas_before_compact;
        if index_ref.deltas.len() + 1 > threshold {
            let state = state.apply(IndexEvent::ThresholdExceeded)?;
            return self
                .compact_into_main(
                    dataset,
                    &index_store,
                    &index_ref,
                    &model,
                    Some((&postings, fragment_ids.as_slice())),
                    state,
                    rows_merged,
                )
                .await;
        }

        let delta = write_postings(&index_store, &model, &postings, fragment_ids).await?;
        let mut deltas = index_ref.deltas.clone();
        deltas.push(delta.clone());
        let published =
            match publish(dataset, &index_ref, index_ref.main.clone(), deltas).await {
                Ok(published) => published,
                Err(e) => {
                    discard_segment(&index_store, &delta.id).await;
                    return Err(e);
                }
            };
        debug!(column, segment_id = %delta.id, rows = delta.num_rows, "published delta");
        Ok(OptimizeSummary {
            column: column.to_string(),
            rows_merged,
            delta_count: published.deltas.len(),
            compacted: false,
            version: published.version,
        })
    }

    async fn model(
        &self,
        dataset: &Dataset,
        index_store: &IndexStore,
        index_ref: &IndexRef,
    ) -> Result<Arc<LoadedModel>> {
        self.ctx
            .cache
            .get_or_load(dataset.uri(), &index_ref.column, &index_ref.model_id, index_store)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn compact_into_main(
        &self,
        dataset: &mut Dataset,
        index_store: &IndexStore,
        index_ref: &IndexRef,
        model: &LoadedModel,
        pending: Option<(&PartitionedPostings, &[u32])>,
        state: IndexState,
        rows_merged: usize,
    ) -> Result<OptimizeSummary> {
        let column = index_ref.column.as_str();
        let segments: Vec<SegmentRef> = index_ref.segments().cloned().collect();
        info!(
            column,
            deltas = index_ref.deltas.len(),
            pending = pending.is_some(),
            "compacting index segments"
        );

        let outcome = merge_segments(
            index_store,
            &segments,
            pending,
            model.ivf.num_partitions(),
            posting_shape(model, index_ref.params.store_vectors),
        )
        .await;
        let written = match outcome {
            Ok(outcome) => {
                write_postings(index_store, model, &outcome.postings, outcome.fragment_ids).await
            }
            Err(e) => Err(e),
        };
        let main = match written {
            Ok(main) => main,
            Err(e) => {
                compaction_failed(column);
                return Err(e);
            }
        };

        let published = match publish(dataset, index_ref, main.clone(), Vec::new()).await {
            Ok(published) => published,
            Err(e) => {
                compaction_failed(column);
                discard_segment(index_store, &main.id).await;
                return Err(e);
            }
        };
        let state = state.apply(IndexEvent::Swapped)?;
        debug_assert_eq!(state, IndexState::Published);

        for old in &segments {
            if let Err(e) = index_store.delete_segment(&old.id).await {
                warn!(segment_id = %old.id, error = %e, "failed to delete compacted segment");
            }
        }
        crate::metrics::COMPACTIONS_TOTAL
            .with_label_values(&[column, "success"])
            .inc();

        Ok(OptimizeSummary {
            column: column.to_string(),
            rows_merged,
            delta_count: 0,
            compacted: true,
            version: published.version,
        })
    }
}

fn compaction_failed(column: &str) {
    crate::metrics::COMPACTIONS_TOTAL
        .with_label_values(&[column, "failed"])
        .inc();
}

async fn discard_segment(index_store: &IndexStore, segment_id: &str) {
    if let Err(e) = index_store.delete_segment(segment_id).await {
        warn!(segment_id, error = %e, "failed to remove unpublished segment");
    }
}

/// Swap in new segments, provided the index is still the one we read.
async fn publish(
    dataset: &mut Dataset,
    expected: &IndexRef,
    main: SegmentRef,
    deltas: Vec<SegmentRef>,
) -> Result<IndexRef> {
    let uri = dataset.uri().to_string();
    let mut published = None;
    dataset
        .update_manifest(|manifest| {
            let current = manifest.index(&expected.column).ok_or_else(|| {
                QuiverError::IndexNotFound {
                    column: expected.column.clone(),
                }
            })?;
            if current.version != expected.version || current.model_id != expected.model_id {
                return Err(QuiverError::ManifestConflict { uri: uri.clone() });
            }
            let mut next = current.clone();
            next.main = main.clone();
            next.deltas = deltas.clone();
            next.version += 1;
            next.updated_at = Utc::now();
            manifest.set_index(next.clone());
            published = Some(next);
            Ok(())
        })
        .await?;
    published.ok_or_else(|| QuiverError::CorruptIndex("publish produced no index".into()))
}
