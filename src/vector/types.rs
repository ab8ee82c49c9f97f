//! Type-safe wrappers and core types for the vector index.
//!
//! Newtypes keep document ids, coarse cells and partitions from being mixed up
//! with each other or with plain counters. All of them serialize to fixed-width
//! little-endian bytes for the on-disk formats.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Output dimension of the default embedding model (all-MiniLM-L6-v2).
pub const VECTOR_DIMENSION_384: usize = 384;

/// Tolerance used when checking that encoder output is unit length.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

/// Globally unique, dense document identifier.
///
/// Ids are assigned per partition as a contiguous range in the order the
/// corpus stream was consumed, so `DocumentId(i)` is also the position of the
/// document in the id-mapping file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(u64);

impl DocumentId {
    /// Creates a new `DocumentId`.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying u64 value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Converts to little-endian bytes for storage.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Creates from little-endian bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a coarse quantizer cell (Voronoi cell).
///
/// Cells are zero-based because they index directly into centroid and
/// posting-list tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u32);

impl CellId {
    /// Creates a new `CellId`.
    #[must_use]
    pub const fn new(cell: u32) -> Self {
        Self(cell)
    }

    /// Returns the underlying u32 value.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Returns the cell as a table index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Index of a corpus partition, and of the segment built from it.
///
/// Partition indices can be zero (for the first partition), so we use
/// a plain u32 rather than NonZeroU32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionIndex(u32);

impl PartitionIndex {
    /// Creates a new `PartitionIndex`.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying u32 value.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Converts to little-endian bytes for storage.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Creates from little-endian bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range of document ids owned by one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    /// First id of the range.
    pub start: DocumentId,
    /// Number of ids in the range.
    pub len: u64,
}

impl IdRange {
    #[must_use]
    pub const fn new(start: DocumentId, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last id of the range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.get() + self.len
    }

    #[must_use]
    pub const fn contains(&self, id: DocumentId) -> bool {
        id.get() >= self.start.get() && id.get() < self.end()
    }

    /// Iterates over every id in the range.
    pub fn ids(&self) -> impl Iterator<Item = DocumentId> + use<> {
        (self.start.get()..self.end()).map(DocumentId::new)
    }
}

/// Checks that `ranges` tile `[0, total)` exactly: no gaps, no overlaps.
///
/// The ranges may be given in any order. Returns a description of the first
/// violation found.
pub fn check_id_partition(ranges: &[IdRange], total: u64) -> Result<(), String> {
    let mut sorted: Vec<IdRange> = ranges.to_vec();
    sorted.sort_by_key(|r| (r.start, r.len));

    let mut next = 0u64;
    for range in &sorted {
        match range.start.get().cmp(&next) {
            Ordering::Less => {
                return Err(format!(
                    "id range [{}, {}) overlaps ids below {next}",
                    range.start,
                    range.end()
                ));
            }
            Ordering::Greater => {
                return Err(format!(
                    "gap in id space: ids [{next}, {}) are not owned by any partition",
                    range.start
                ));
            }
            Ordering::Equal => next = range.end(),
        }
    }

    if next != total {
        return Err(format!("id ranges cover [0, {next}) but corpus has {total} documents"));
    }
    Ok(())
}

/// A single query result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: DocumentId,
    /// Cosine distance, `1 - inner_product`. Lower is closer.
    pub distance: f32,
}

impl SearchHit {
    /// Result ordering: ascending distance, ties broken by lower id.
    pub fn rank_cmp(a: &Self, b: &Self) -> Ordering {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.id.cmp(&b.id))
    }
}

impl Eq for SearchHit {}

impl PartialOrd for SearchHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders hits so that the *worst* hit is the greatest, which lets a
/// max-heap of size k keep the best k.
impl Ord for SearchHit {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::rank_cmp(self, other)
    }
}

/// Type-safe wrapper for vector dimensions.
///
/// Ensures runtime validation of vector dimensions to prevent dimension
/// mismatches during operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Creates a standard 384-dimensional vector dimension.
    #[must_use]
    pub const fn dimension_384() -> Self {
        Self(VECTOR_DIMENSION_384)
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Validates dimension, finiteness and unit length.
    pub fn validate_unit_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        self.validate_vector(vector)?;
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(VectorError::NonFinite);
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
            return Err(VectorError::NotNormalized { norm });
        }
        Ok(())
    }
}

/// Errors that can occur during vector operations.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error(
        "Vector is not unit length (norm {norm})\nSuggestion: The encoder must L2-normalize its output"
    )]
    NotNormalized { norm: f32 },

    #[error("Vector contains NaN or infinite components")]
    NonFinite,

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, len: u64) -> IdRange {
        IdRange::new(DocumentId::new(start), len)
    }

    #[test]
    fn test_document_id_serialization() {
        let id = DocumentId::new(1 << 40);
        assert_eq!(DocumentId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn test_partition_index_ordering() {
        let first = PartitionIndex::new(0);
        let second = PartitionIndex::new(7);
        assert!(first < second);
        assert_eq!(PartitionIndex::from_bytes(second.to_bytes()), second);
        assert_eq!(second.to_string(), "7");
    }

    #[test]
    fn test_id_range_membership() {
        let r = range(10, 5);
        assert_eq!(r.end(), 15);
        assert!(r.contains(DocumentId::new(10)));
        assert!(r.contains(DocumentId::new(14)));
        assert!(!r.contains(DocumentId::new(15)));
        assert_eq!(r.ids().count(), 5);
    }

    #[test]
    fn test_check_id_partition_accepts_exact_tiling() {
        let ranges = [range(20, 5), range(0, 10), range(10, 10)];
        assert!(check_id_partition(&ranges, 25).is_ok());
        assert!(check_id_partition(&[], 0).is_ok());
    }

    #[test]
    fn test_check_id_partition_rejects_gaps_and_overlaps() {
        let gap = check_id_partition(&[range(0, 10), range(11, 4)], 15).unwrap_err();
        assert!(gap.contains("gap"));

        let overlap = check_id_partition(&[range(0, 10), range(9, 6)], 15).unwrap_err();
        assert!(overlap.contains("overlaps"));

        let short = check_id_partition(&[range(0, 10)], 12).unwrap_err();
        assert!(short.contains("12"));
    }

    #[test]
    fn test_search_hit_ordering_breaks_ties_by_id() {
        let mut hits = vec![
            SearchHit { id: DocumentId::new(9), distance: 0.5 },
            SearchHit { id: DocumentId::new(2), distance: 0.5 },
            SearchHit { id: DocumentId::new(5), distance: 0.1 },
        ];
        hits.sort_by(SearchHit::rank_cmp);
        let ids: Vec<u64> = hits.iter().map(|h| h.id.get()).collect();
        assert_eq!(ids, vec![5, 2, 9]);
    }

    #[test]
    fn test_vector_dimension() {
        let dim = VectorDimension::new(384).unwrap();
        assert_eq!(dim.get(), 384);
        assert_eq!(VectorDimension::dimension_384(), dim);
        assert!(VectorDimension::new(0).is_err());

        assert!(dim.validate_vector(&vec![0.1; 384]).is_ok());
        assert!(dim.validate_vector(&vec![0.1; 100]).is_err());
    }

    #[test]
    fn test_unit_vector_validation() {
        let dim = VectorDimension::new(2).unwrap();
        assert!(dim.validate_unit_vector(&[0.6, 0.8]).is_ok());
        assert!(matches!(
            dim.validate_unit_vector(&[3.0, 4.0]),
            Err(VectorError::NotNormalized { .. })
        ));
        assert!(matches!(
            dim.validate_unit_vector(&[f32::NAN, 1.0]),
            Err(VectorError::NonFinite)
        ));
        assert!(matches!(
            dim.validate_unit_vector(&[1.0]),
            Err(VectorError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }
}
