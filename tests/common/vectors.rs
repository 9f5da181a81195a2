use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quiver::dataset::{Dataset, VectorTable, WriteMode};
use quiver::storage::QuiverStore;

pub const COLUMN: &str = "vector";

pub fn random_values(rows: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows * dim).map(|_| rng.gen::<f32>()).collect()
}

pub fn random_table(rows: usize, dim: usize, seed: u64) -> VectorTable {
    VectorTable::new()
        .with_column(COLUMN, dim, random_values(rows, dim, seed))
        .unwrap()
}

pub async fn create_dataset(store: &QuiverStore, uri: &str, rows: usize, dim: usize) -> Dataset {
    Dataset::write(store, uri, &random_table(rows, dim, 1), WriteMode::Create)
        .await
        .unwrap()
}

pub async fn append_rows(
    store: &QuiverStore,
    uri: &str,
    rows: usize,
    dim: usize,
    seed: u64,
) -> Dataset {
    Dataset::write(store, uri, &random_table(rows, dim, seed), WriteMode::Append)
        .await
        .unwrap()
}
