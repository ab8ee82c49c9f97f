//! Partitioned IVF-PQ index builder and query engine for neural code search.

pub mod config;
pub mod display;
pub mod error;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{ErrorContext, IndexError, IndexResult, PartitionFailure};
pub use vector::{
    BuildState, Codebook, DocumentId, IndexHandle, IndexPipeline, IndexTrainer, QueryEngine,
    QueryService, SearchHit, SegmentMerger, ShardBuilder, WorkerPool,
};
