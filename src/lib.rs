//! Quiver: IVF_PQ index construction and maintenance over object storage.

pub mod cancel;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod error;
pub mod harness;
pub mod index;
pub mod metrics;
pub mod optimize;
pub mod startup;
pub mod storage;
pub mod types;
