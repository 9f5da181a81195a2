//! IVF-PQ index engine.
//!
//! Training (`kmeans`, `ivf`, `pq`), nearest-centroid assignment (`assign`),
//! posting-list encoding (`posting`), durable layout (`store`) and the build
//! entry points (`builder`).

pub mod assign;
pub mod builder;
pub mod cache;
pub mod centroids;
pub mod distance;
pub mod ivf;
pub mod kmeans;
pub mod params;
pub mod posting;
pub mod pq;
pub mod store;

use std::sync::Arc;

use crate::config::{AcceleratorDevice, Config};
use crate::types::Accelerator;

pub use assign::{Assigner, BatchDistanceComputer, PartitionAssignment};
pub use builder::{IndexBuilder, IndicesBuilder};
pub use cache::{ColumnLocks, IndexCache};
pub use centroids::CentroidSet;
pub use ivf::IvfModel;
pub use params::{CreateIndexRequest, IndexParams};
pub use posting::PostingList;
pub use pq::ProductQuantizer;
pub use store::{IndexStore, LoadedModel, Segment, SegmentMetadata};

/// State shared by index builds and optimize passes.
pub struct IndexContext {
    pub config: Config,
    pub cache: IndexCache,
    pub locks: ColumnLocks,
}

impl IndexContext {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            cache: IndexCache::new(),
            locks: ColumnLocks::new(),
        })
    }

    /// Accelerator request used when the caller does not pick one.
    pub fn default_accelerator(&self) -> Accelerator {
        match self.config.accelerator.device {
            AcceleratorDevice::None => Accelerator::None,
            AcceleratorDevice::Auto | AcceleratorDevice::Matrix => Accelerator::Preferred,
        }
    }
}
