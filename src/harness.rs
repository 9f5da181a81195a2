//! Index benchmark scenario: build, append, optimize, then the two training
//! sub-stages in isolation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::Cancellation;
use crate::config::Config;
use crate::dataset::{Dataset, VectorTable, WriteMode};
use crate::error::{QuiverError, Result};
use crate::index::{CreateIndexRequest, IndexBuilder, IndexContext, IndicesBuilder};
use crate::optimize::IndexOptimizer;
use crate::storage::QuiverStore;
use crate::types::Accelerator;

pub const VECTOR_COLUMN: &str = "vector";

/// Wall-clock time of each scenario stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioTimings {
    pub write: Duration,
    pub create_index: Duration,
    pub append: Duration,
    pub optimize: Duration,
    pub train_ivf: Duration,
    /// `None` when no accelerator was available.
    pub assign_partitions: Option<Duration>,
}

/// `num_rows` vectors of `dim` uniform `[0, 1)` floats in a `vector` column.
pub fn gen_table(num_rows: usize, dim: usize, seed: u64) -> Result<VectorTable> {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..num_rows * dim).map(|_| rng.gen::<f32>()).collect();
    VectorTable::new().with_column(VECTOR_COLUMN, dim, values)
}

/// Sizes of the append batches, spreading any remainder over the first ones.
pub fn append_batch_sizes(total: usize, batches: usize) -> Vec<usize> {
    if batches == 0 {
        return Vec::new();
    }
    let base = total / batches;
    let extra = total % batches;
    (0..batches)
        .map(|i| base + usize::from(i < extra))
        .filter(|&n| n > 0)
        .collect()
}

/// Run the full scenario against `store` and report stage timings.
pub async fn run_scenario(config: &Config, store: &QuiverStore) -> Result<ScenarioTimings> {
    let harness = &config.harness;
    let ctx = IndexContext::new(config.clone());
    let seed = config.indexing.seed.unwrap_or(0);
    let mut timings = ScenarioTimings::default();

    let table = gen_table(harness.num_rows, harness.dim, seed)?;
    let start = Instant::now();
    let mut dataset =
        Dataset::write(store, &harness.dataset_uri, &table, WriteMode::Overwrite).await?;
    timings.write = start.elapsed();
    info!(rows = dataset.count_rows(), dim = harness.dim, "dataset written");

    let request = CreateIndexRequest::new(VECTOR_COLUMN)
        .num_partitions(config.indexing.default_num_partitions)
        .num_sub_vectors(config.indexing.default_num_sub_vectors)
        .num_bits(config.indexing.default_num_bits)
        .accelerator(ctx.default_accelerator())
        .replace(true);
    let start = Instant::now();
    IndexBuilder::new(Arc::clone(&ctx))
        .create_index(&mut dataset, &request, &Cancellation::none())
        .await?;
    timings.create_index = start.elapsed();

    let start = Instant::now();
    for (i, rows) in append_batch_sizes(harness.num_new_rows, harness.num_small_indexes)
        .into_iter()
        .enumerate()
    {
        let table = gen_table(rows, harness.dim, seed.wrapping_add(1 + i as u64))?;
        dataset = Dataset::write(store, &harness.dataset_uri, &table, WriteMode::Append).await?;
    }
    timings.append = start.elapsed();

    let start = Instant::now();
    let summaries = IndexOptimizer::new(Arc::clone(&ctx))
        .optimize_indices(&mut dataset, &Cancellation::none())
        .await?;
    timings.optimize = start.elapsed();
    for s in &summaries {
        info!(
            column = %s.column,
            rows_merged = s.rows_merged,
            deltas = s.delta_count,
            compacted = s.compacted,
            "optimized index"
        );
    }

    let stages = IndicesBuilder::new(Arc::clone(&ctx), &dataset, VECTOR_COLUMN)?;
    let start = Instant::now();
    let ivf = stages
        .train_ivf(config.indexing.default_num_partitions)
        .await?;
    timings.train_ivf = start.elapsed();

    let start = Instant::now();
    match stages
        .assign_ivf_partitions(&ivf, None, Accelerator::Required)
        .await
    {
        Ok(assignment) => {
            timings.assign_partitions = Some(start.elapsed());
            info!(rows = assignment.len(), "assigned partitions on accelerator");
        }
        Err(QuiverError::AcceleratorUnavailable { requested }) => {
            warn!(%requested, "skipping accelerated partition assignment");
        }
        Err(e) => return Err(e),
    }

    Ok(timings)
}
