//! Full index construction and the separately invokable training stages.
//!
//! `create_index` runs sample -> IVF training -> PQ training -> assign and
//! encode every row -> write artifacts -> manifest swap. Nothing is visible
//! to readers before the swap; on any failure the freshly written artifacts
//! are removed and the previous index stays published.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::cancel::Cancellation;
use crate::dataset::{Dataset, IndexRef, ScanFilter, SegmentRef, VectorSource};
use crate::error::{QuiverError, Result};
use crate::index::assign::{select_computer, Assigner, BatchDistanceComputer, PartitionAssignment};
use crate::index::ivf::IvfModel;
use crate::index::params::{CreateIndexRequest, IndexParams};
use crate::index::posting::{PartitionedPostings, PostingShape};
use crate::index::pq::ProductQuantizer;
use crate::index::store::{IndexStore, LoadedModel, SegmentMetadata};
use crate::index::IndexContext;
use crate::types::{Accelerator, VectorBatch};

/// Assign one batch to partitions and PQ-encode it.
pub(crate) fn encode_batch(
    model: &LoadedModel,
    computer: Arc<dyn BatchDistanceComputer>,
    batch: &VectorBatch,
) -> Result<(Vec<u32>, Vec<u16>)> {
    let assignment = Assigner::new(Arc::clone(&computer)).assign(&model.ivf, batch)?;
    let codes = model.pq.encode(
        &model.ivf,
        &batch.values,
        &assignment.partitions,
        computer.as_ref(),
    )?;
    Ok((assignment.partitions, codes))
}

/// Posting-list shape for a model.
pub(crate) fn posting_shape(model: &LoadedModel, store_vectors: bool) -> PostingShape {
    PostingShape {
        num_sub_vectors: model.pq.num_sub_vectors(),
        dim: model.pq.dim(),
        code_width: model.pq.code_width(),
        has_vectors: store_vectors,
    }
}

/// Encode every row of `source` into per-partition posting lists.
///
/// Cancellation is checked between batches.
pub(crate) async fn encode_source(
    source: &mut dyn VectorSource,
    model: &Arc<LoadedModel>,
    store_vectors: bool,
    computer: &Arc<dyn BatchDistanceComputer>,
    cancel: &Cancellation,
) -> Result<PartitionedPostings> {
    let mut postings =
        PartitionedPostings::new(model.ivf.num_partitions(), posting_shape(model, store_vectors));
    while let Some(batch) = source.next_batch().await? {
        cancel.check()?;
        let model = Arc::clone(model);
        let computer = Arc::clone(computer);
        let (batch, partitions, codes) = tokio::task::spawn_blocking(move || {
            encode_batch(&model, computer, &batch).map(|(p, c)| (batch, p, c))
        })
        .await??;
        postings.add_batch(&batch.row_ids, &partitions, &codes, &batch.values)?;
    }
    Ok(postings)
}

/// Write a segment of encoded postings and describe it.
pub(crate) async fn write_postings(
    index_store: &IndexStore,
    model: &LoadedModel,
    postings: &PartitionedPostings,
    fragment_ids: Vec<u32>,
) -> Result<SegmentRef> {
    let lists = postings.lists();
    let shape = lists
        .first()
        .map(|l| l.shape())
        .ok_or_else(|| QuiverError::CorruptIndex("model has no partitions".into()))?;
    let metadata = SegmentMetadata {
        segment_id: Ulid::new().to_string(),
        model_id: model.model_id.clone(),
        num_partitions: lists.len(),
        num_sub_vectors: shape.num_sub_vectors,
        num_bits: model.pq.num_bits(),
        dim: shape.dim,
        num_rows: postings.num_rows(),
        partition_sizes: postings.partition_sizes(),
        has_vectors: shape.has_vectors,
        fragment_ids: fragment_ids.clone(),
        created_at: Utc::now(),
    };
    index_store.write_segment(&metadata, lists).await?;
    Ok(SegmentRef {
        id: metadata.segment_id,
        num_rows: metadata.num_rows,
        fragment_ids,
    })
}

/// Train IVF then PQ on a worker thread.
async fn train_model(
    ivf_sample: VectorBatch,
    pq_sample: Option<VectorBatch>,
    params: IndexParams,
    computer: Arc<dyn BatchDistanceComputer>,
    cancel: Cancellation,
) -> Result<(IvfModel, ProductQuantizer)> {
    tokio::task::spawn_blocking(move || {
        let ivf = IvfModel::train(&ivf_sample, &params, computer.as_ref(), &cancel)?;
        cancel.check()?;
        let pq_sample = pq_sample.as_ref().unwrap_or(&ivf_sample);
        let pq = ProductQuantizer::train(pq_sample, &ivf, &params, computer.as_ref(), &cancel)?;
        Ok((ivf, pq))
    })
    .await?
}

/// Builds complete IVF_PQ indices.
pub struct IndexBuilder {
    ctx: Arc<IndexContext>,
}

impl IndexBuilder {
    pub fn new(ctx: Arc<IndexContext>) -> Self {
        Self { ctx }
    }

    /// Build and publish an index on `request.column`.
    ///
    /// Configuration and data preconditions are checked before any training.
    #[instrument(skip_all, fields(uri = %dataset.uri(), column = %request.column))]
    pub async fn create_index(
        &self,
        dataset: &mut Dataset,
        request: &CreateIndexRequest,
        cancel: &Cancellation,
    ) -> Result<IndexRef> {
        let start = Instant::now();
        let result = self.build(dataset, request, cancel).await;
        match &result {
            Ok(index_ref) => {
                let index_type = index_ref.params.index_type.to_string();
                crate::metrics::INDEX_BUILD_DURATION
                    .with_label_values(&[request.column.as_str(), index_type.as_str()])
                    .observe(start.elapsed().as_secs_f64());
                info!(
                    rows = index_ref.main.num_rows,
                    model_id = %index_ref.model_id,
                    elapsed_ms = start.elapsed().as_millis(),
                    "index published"
                );
            }
            Err(e) => {
                crate::metrics::INDEX_ERRORS_TOTAL
                    .with_label_values(&["create_index", e.kind()])
                    .inc();
                warn!(error = %e, "create_index failed");
            }
        }
        result
    }

    async fn build(
        &self,
        dataset: &mut Dataset,
        request: &CreateIndexRequest,
        cancel: &Cancellation,
    ) -> Result<IndexRef> {
        let config = &self.ctx.config;
        let column = request.column.as_str();
        let params = request.to_params(&config.indexing)?;

        let lock = self.ctx.locks.lock_for(dataset.uri(), column);
        let _guard = lock.lock().await;
        dataset.checkout_latest().await?;

        let dim = dataset.column_dim(column)?;
        params.validate(dim)?;
        if dataset.index_ref(column).is_some() && !request.replace {
            return Err(QuiverError::IndexExists {
                column: column.to_string(),
            });
        }
        let rows = dataset.count_rows();
        params.check_rows(rows)?;
        let computer = select_computer(
            request.accelerator,
            &config.accelerator,
            config.indexing.chunk_size,
        )?;
        cancel.check()?;

        info!(
            rows,
            dim,
            partitions = params.num_partitions,
            sub_vectors = params.num_sub_vectors,
            bits = params.num_bits,
            metric = %params.metric,
            path = computer.name(),
            "building IVF_PQ index"
        );

        let ivf_rows = params.ivf_sample_size(rows);
        let pq_rows = params.pq_sample_size(rows);
        let ivf_sample = dataset.sample(column, ivf_rows, params.seed).await?;
        let pq_sample = if pq_rows == ivf_rows {
            None
        } else {
            Some(dataset.sample(column, pq_rows, params.seed.wrapping_add(1)).await?)
        };
        let (ivf, pq) = train_model(
            ivf_sample,
            pq_sample,
            params.clone(),
            Arc::clone(&computer),
            cancel.clone(),
        )
        .await?;
        let model = Arc::new(LoadedModel {
            model_id: Ulid::new().to_string(),
            ivf,
            pq,
        });

        let mut scanner = dataset.scan(column, ScanFilter::All, config.indexing.scan_batch_size)?;
        let postings =
            encode_source(&mut scanner, &model, params.store_vectors, &computer, cancel).await?;
        debug!(rows = postings.num_rows(), "encoded all rows");
        cancel.check()?;

        let index_store = IndexStore::new(dataset.store().clone(), dataset.uri(), column);
        let written = async {
            index_store
                .write_model(&model.model_id, &model.ivf, &model.pq)
                .await?;
            write_postings(&index_store, &model, &postings, scanner.fragment_ids().to_vec()).await
        }
        .await;
        let main = match written {
            Ok(main) => main,
            Err(e) => {
                discard(&index_store, &model.model_id, None).await;
                return Err(e);
            }
        };

        // Publish. Cancellation is not consulted from here on.
        let mut previous: Option<IndexRef> = None;
        let mut published: Option<IndexRef> = None;
        let replace = request.replace;
        let publish = dataset
            .update_manifest(|manifest| {
                let prior = manifest.index(column).cloned();
                if prior.is_some() && !replace {
                    return Err(QuiverError::IndexExists {
                        column: column.to_string(),
                    });
                }
                let index_ref = IndexRef {
                    column: column.to_string(),
                    index_id: Ulid::new().to_string(),
                    model_id: model.model_id.clone(),
                    params: params.clone(),
                    dim,
                    main: main.clone(),
                    deltas: Vec::new(),
                    version: prior.as_ref().map_or(1, |p| p.version + 1),
                    updated_at: Utc::now(),
                };
                manifest.set_index(index_ref.clone());
                previous = prior;
                published = Some(index_ref);
                Ok(())
            })
            .await;
        if let Err(e) = publish {
            discard(&index_store, &model.model_id, Some(&main.id)).await;
            return Err(e);
        }
        let index_ref = published
            .ok_or_else(|| QuiverError::CorruptIndex("publish produced no index".into()))?;

        if let Some(old) = previous {
            remove_index_artifacts(&index_store, &old).await;
        }
        self.ctx
            .cache
            .insert(dataset.uri(), column, Arc::clone(&model));
        crate::metrics::ROWS_INDEXED_TOTAL
            .with_label_values(&[column, "build"])
            .inc_by(index_ref.main.num_rows as u64);
        Ok(index_ref)
    }
}

/// Best-effort removal of artifacts that never got published.
async fn discard(index_store: &IndexStore, model_id: &str, segment_id: Option<&str>) {
    if let Err(e) = index_store.delete_model(model_id).await {
        warn!(model_id, error = %e, "failed to remove unpublished model");
    }
    if let Some(segment_id) = segment_id {
        if let Err(e) = index_store.delete_segment(segment_id).await {
            warn!(segment_id, error = %e, "failed to remove unpublished segment");
        }
    }
}

/// Best-effort removal of a replaced index's model and segments.
async fn remove_index_artifacts(index_store: &IndexStore, old: &IndexRef) {
    if let Err(e) = index_store.delete_model(&old.model_id).await {
        warn!(model_id = %old.model_id, error = %e, "failed to delete replaced model");
    }
    for segment in old.segments() {
        if let Err(e) = index_store.delete_segment(&segment.id).await {
            warn!(segment_id = %segment.id, error = %e, "failed to delete replaced segment");
        }
    }
    debug!(model_id = %old.model_id, "removed replaced index artifacts");
}

/// Separately timed training and assignment stages on one column.
pub struct IndicesBuilder<'a> {
    ctx: Arc<IndexContext>,
    dataset: &'a Dataset,
    column: String,
    dim: usize,
}

impl<'a> IndicesBuilder<'a> {
    pub fn new(ctx: Arc<IndexContext>, dataset: &'a Dataset, column: &str) -> Result<Self> {
        let dim = dataset.column_dim(column)?;
        Ok(Self {
            ctx,
            dataset,
            column: column.to_string(),
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn computer(&self, accelerator: Accelerator) -> Result<Arc<dyn BatchDistanceComputer>> {
        select_computer(
            accelerator,
            &self.ctx.config.accelerator,
            self.ctx.config.indexing.chunk_size,
        )
    }

    /// Train IVF centroids only.
    #[instrument(skip(self), fields(column = %self.column))]
    pub async fn train_ivf(&self, num_partitions: usize) -> Result<IvfModel> {
        let mut params = IndexParams::from_config(&self.ctx.config.indexing);
        params.num_partitions = num_partitions;
        if num_partitions == 0 {
            return Err(QuiverError::InvalidConfig("num_partitions must be >= 1".into()));
        }
        let rows = self.dataset.count_rows();
        if rows < num_partitions {
            return Err(QuiverError::InsufficientData {
                required: num_partitions,
                available: rows,
            });
        }
        let computer = self.computer(self.ctx.default_accelerator())?;
        let sample = self
            .dataset
            .sample(&self.column, params.ivf_sample_size(rows), params.seed)
            .await?;
        tokio::task::spawn_blocking(move || {
            IvfModel::train(&sample, &params, computer.as_ref(), &Cancellation::none())
        })
        .await?
    }

    /// Train PQ codebooks against an existing IVF model.
    #[instrument(skip(self, ivf), fields(column = %self.column))]
    pub async fn train_pq(
        &self,
        ivf: &IvfModel,
        num_sub_vectors: usize,
        num_bits: u8,
    ) -> Result<ProductQuantizer> {
        let mut params = IndexParams::from_config(&self.ctx.config.indexing);
        params.metric = ivf.metric();
        params.num_partitions = ivf.num_partitions();
        params.num_sub_vectors = num_sub_vectors;
        params.num_bits = num_bits;
        params.validate(self.dim)?;
        let rows = self.dataset.count_rows();
        if rows < params.codebook_size() {
            return Err(QuiverError::InsufficientData {
                required: params.codebook_size(),
                available: rows,
            });
        }
        let computer = self.computer(self.ctx.default_accelerator())?;
        let sample = self
            .dataset
            .sample(&self.column, params.pq_sample_size(rows), params.seed)
            .await?;
        let ivf = ivf.clone();
        tokio::task::spawn_blocking(move || {
            ProductQuantizer::train(&sample, &ivf, &params, computer.as_ref(), &Cancellation::none())
        })
        .await?
    }

    /// Assign `sample`, or every row of the column when `None`.
    ///
    /// `Accelerator::Required` fails with `AcceleratorUnavailable` before
    /// any work when no accelerator is present.
    #[instrument(skip(self, ivf, sample), fields(column = %self.column))]
    pub async fn assign_ivf_partitions(
        &self,
        ivf: &IvfModel,
        sample: Option<&VectorBatch>,
        accelerator: Accelerator,
    ) -> Result<PartitionAssignment> {
        if ivf.dim() != self.dim {
            return Err(QuiverError::DimensionMismatch {
                expected: self.dim,
                actual: ivf.dim(),
            });
        }
        let assigner = Assigner::new(self.computer(accelerator)?);
        let ivf = Arc::new(ivf.clone());

        if let Some(batch) = sample {
            let batch = batch.clone();
            return tokio::task::spawn_blocking(move || assigner.assign(&ivf, &batch)).await?;
        }

        let mut scanner = self.dataset.scan(
            &self.column,
            ScanFilter::All,
            self.ctx.config.indexing.scan_batch_size,
        )?;
        let mut out = PartitionAssignment::default();
        while let Some(batch) = scanner.next_batch().await? {
            let assigner = assigner.clone();
            let ivf = Arc::clone(&ivf);
            let part = tokio::task::spawn_blocking(move || assigner.assign(&ivf, &batch)).await??;
            out.extend(part);
        }
        debug!(rows = out.len(), "assigned dataset to partitions");
        Ok(out)
    }
}
