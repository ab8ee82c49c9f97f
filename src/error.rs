//! Error types for the vector index builder and query engine
//!
//! This module provides structured error types using thiserror for better
//! error handling and actionable error messages.

use crate::vector::{BuildState, ClusteringError, PartitionIndex};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for index operations
#[derive(Error, Debug)]
pub enum IndexError {
    /// Training errors
    #[error(
        "Training sample has {samples} vectors but {required} are needed to train {cells} coarse cells"
    )]
    TrainingDataInsufficient {
        samples: usize,
        required: usize,
        cells: usize,
    },

    /// Encoder output broke the dimension / unit-norm / count contract
    #[error("Encoder contract violated{}: {reason}", partition_label(.partition))]
    EncodingContractViolation {
        partition: Option<PartitionIndex>,
        reason: String,
    },

    /// Shard building errors
    #[error("Failed to encode partition {partition}: {reason}")]
    ShardEncodingFailure {
        partition: PartitionIndex,
        reason: String,
    },

    #[error("{} of the partitions failed to build: {}", .failures.len(), summarize_failures(.failures))]
    PartitionsFailed { failures: Vec<PartitionFailure> },

    /// Merge errors
    #[error("Segment for partition {partition} is missing at '{path}'")]
    MergeMissingSegment {
        partition: PartitionIndex,
        path: PathBuf,
    },

    /// Load errors
    #[error("Index artifact '{path}' is corrupt: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    /// Query errors
    #[error("Query has dimension {actual} but the index expects {expected}")]
    QueryDimensionMismatch { expected: usize, actual: usize },

    /// Build lifecycle errors
    #[error("Invalid build state transition from {from} to {to}")]
    InvalidStateTransition { from: BuildState, to: BuildState },

    /// Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// File system errors
    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Embedding model errors outside of a partition build
    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Serialization failed for '{path}': {reason}")]
    Serialization { path: PathBuf, reason: String },

    #[error("Id mapping has {mapping} entries but the index holds {indexed} vectors")]
    IdMappingMismatch { mapping: usize, indexed: u64 },

    #[error("Clustering failed: {0}")]
    Clustering(#[from] ClusteringError),
}

/// One failed partition reported by the worker pool.
#[derive(Debug)]
pub struct PartitionFailure {
    pub partition: PartitionIndex,
    pub error: IndexError,
}

fn partition_label(partition: &Option<PartitionIndex>) -> String {
    match partition {
        Some(p) => format!(" in partition {p}"),
        None => String::new(),
    }
}

fn summarize_failures(failures: &[PartitionFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.partition, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl IndexError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::TrainingDataInsufficient { .. } => "TRAINING_DATA_INSUFFICIENT",
            Self::EncodingContractViolation { .. } => "ENCODING_CONTRACT_VIOLATION",
            Self::ShardEncodingFailure { .. } => "SHARD_ENCODING_FAILURE",
            Self::PartitionsFailed { .. } => "PARTITIONS_FAILED",
            Self::MergeMissingSegment { .. } => "MERGE_MISSING_SEGMENT",
            Self::IndexCorrupt { .. } => "INDEX_CORRUPT",
            Self::QueryDimensionMismatch { .. } => "QUERY_DIMENSION_MISMATCH",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::InvalidConfig { .. } => "CONFIG_ERROR",
            Self::FileRead { .. } => "FILE_READ_ERROR",
            Self::FileWrite { .. } => "FILE_WRITE_ERROR",
            Self::Encoder(_) => "ENCODER_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::IdMappingMismatch { .. } => "ID_MAPPING_MISMATCH",
            Self::Clustering(_) => "CLUSTERING_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::TrainingDataInsufficient { .. } => vec![
                "Increase 'build.train_sample_size' or lower 'training.cells'",
                "An empty corpus cannot be indexed",
            ],
            Self::EncodingContractViolation { .. } => vec![
                "Check that the embedding model outputs L2-normalized vectors",
                "Make sure every partition uses the model the codebook was trained with",
            ],
            Self::ShardEncodingFailure { .. } | Self::PartitionsFailed { .. } => vec![
                "Re-run 'codesearch-index build --resume' to rebuild only the failed partitions",
                "Lower 'build.sub_batch_size' if the encoder ran out of memory",
            ],
            Self::MergeMissingSegment { .. } => vec![
                "Run 'codesearch-index build --resume' to produce the missing segments",
            ],
            Self::IndexCorrupt { .. } => vec![
                "Run 'codesearch-index build' to rebuild the index from scratch",
                "Check for disk errors or filesystem corruption",
            ],
            Self::QueryDimensionMismatch { .. } => vec![
                "Encode queries with the same model that built the index",
            ],
            Self::InvalidConfig { .. } => vec![
                "Run 'codesearch-index config' to inspect the effective settings",
            ],
            Self::FileRead { .. } => vec![
                "Check that the file exists and you have read permissions",
                "Ensure the file is not locked by another process",
            ],
            Self::IdMappingMismatch { .. } => vec![
                "Regenerate the mapping with 'codesearch-index id-map' from the indexed corpus",
            ],
            _ => vec![],
        }
    }

    /// Shorthand for an [`IndexError::IndexCorrupt`].
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::IndexCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Helper trait for attaching a path to I/O errors
pub trait ErrorContext<T> {
    /// Map the error to [`IndexError::FileRead`].
    fn read_context(self, path: &std::path::Path) -> Result<T, IndexError>;

    /// Map the error to [`IndexError::FileWrite`].
    fn write_context(self, path: &std::path::Path) -> Result<T, IndexError>;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn read_context(self, path: &std::path::Path) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::FileRead {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_context(self, path: &std::path::Path) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }
}
