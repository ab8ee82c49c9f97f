//! Partitioned IVF-PQ vector index for neural code search.
//!
//! # Architecture
//! A codebook (coarse k-means cells plus a product quantizer over residuals)
//! is trained once on a sample of the corpus. The corpus is then cut into
//! partitions with contiguous document ids; a pool of workers encodes each
//! partition into its own segment file. Once every segment exists, the
//! merger streams them into one cell-major data file that the query engine
//! memory-maps and serves read-only.
//!
//! ```text
//! encoder -> IndexTrainer -> ShardBuilder x P (WorkerPool) -> SegmentMerger -> QueryEngine
//! ```

mod atomic;
mod clustering;
mod codebook;
mod corpus;
mod embedding;
mod engine;
mod layout;
mod merge;
mod pipeline;
mod pool;
mod quantizer;
mod segment;
mod shard;
mod trainer;
mod types;
mod watcher;

// Re-export core types for public API
pub use atomic::{StagedFile, write_atomically};
pub use clustering::{
    ClusteringError, DEFAULT_MAX_ITERATIONS, KMeansConfig, KMeansResult, Metric,
    argmax_inner_product, inner_product, kmeans, nearest_centroid, normalize_vector,
};
pub use codebook::{Codebook, Fingerprint, TrainingParams};
pub use corpus::{
    BatchExt, Batches, CorpusReader, CorpusRecord, ExternalId, IdMapping, Partition, Partitions,
    Records, partitions,
};
pub use embedding::{
    DeviceHandle, EmbeddingGenerator, EncoderContext, EncoderFactory, FastEmbedFactory,
    FastEmbedGenerator, MockEmbeddingGenerator, PrecomputedEmbeddings, SharedEncoderFactory,
    default_models_dir, parse_embedding_model, validate_batch,
};
pub use engine::{ExternalHit, IndexHandle, QueryEngine, QueryService, resolve};
pub use layout::{CODEBOOK_FILE, ID_MAPPING_FILE, IndexLayout};
pub use merge::{
    CellExtent, MERGED_META_FILE, MergedIndexMeta, PartitionExtent, SegmentMerger,
    merged_data_file_name, merged_data_files,
};
pub use pipeline::{BuildLifecycle, BuildReport, BuildState, IndexPipeline};
pub use pool::{PartitionOutcome, PoolReport, WorkerConfig, WorkerPool};
pub use quantizer::{MAX_BITS_PER_SUBSPACE, ProductQuantizer};
pub use segment::{SegmentReader, SegmentSummary, SegmentWriter, segment_path, split_entry};
pub use shard::{PartitionTask, ShardBuilder, reusable_segment};
pub use trainer::IndexTrainer;
pub use types::{
    CellId, DocumentId, IdRange, PartitionIndex, SearchHit, UNIT_NORM_TOLERANCE,
    VECTOR_DIMENSION_384, VectorDimension, VectorError, check_id_partition,
};
pub use watcher::IndexWatcher;
