//! Segment merging: the barrier between shard building and serving.
//!
//! The merger reads every segment through a memory map and streams posting
//! lists cell by cell into one contiguous data file, so the full index is
//! never held in memory. A JSON metadata file records where each cell's
//! postings live.
//!
//! # Output
//!
//! ```text
//! merged-<sha256>.ivfdata  cell-major postings: id u64 (LE) | PQ code [code size]
//! merged.meta.json         MergedIndexMeta, naming the data file above
//! ```
//!
//! Data files are named by their checksum, so publishing a new index never
//! overwrites the file the current metadata points at. The data file is
//! published first and the metadata last.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{ErrorContext, IndexError, IndexResult};
use crate::vector::atomic::{StagedFile, write_atomically};
use crate::vector::codebook::{Codebook, Fingerprint};
use crate::vector::segment::{BYTES_PER_ID, SegmentReader, segment_path};
use crate::vector::types::{CellId, IdRange, PartitionIndex, check_id_partition};

/// Current metadata format version.
pub const MERGED_META_VERSION: u32 = 1;

const MERGED_DATA_PREFIX: &str = "merged-";
const MERGED_DATA_SUFFIX: &str = ".ivfdata";

/// File name of the merged index metadata.
pub const MERGED_META_FILE: &str = "merged.meta.json";

/// Location of one cell's postings in the data file, in entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellExtent {
    pub offset: u64,
    pub len: u64,
}

/// Id range contributed by one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionExtent {
    pub partition: PartitionIndex,
    pub ids: IdRange,
}

/// Name of the data file whose contents hash to `checksum`.
pub fn merged_data_file_name(checksum: &Fingerprint) -> String {
    format!("{MERGED_DATA_PREFIX}{}{MERGED_DATA_SUFFIX}", checksum.to_hex())
}

/// Merged data files present in `dir`, sorted by name.
pub fn merged_data_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(MERGED_DATA_PREFIX) && name.ends_with(MERGED_DATA_SUFFIX) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Description of a merged index, stored next to its data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedIndexMeta {
    pub version: u32,
    /// Data file name, relative to the metadata file.
    pub data_file: String,
    pub fingerprint: Fingerprint,
    pub dimension: usize,
    pub nlist: usize,
    pub code_size: usize,
    pub vector_count: u64,
    pub cells: Vec<CellExtent>,
    /// Sorted by first id.
    pub partitions: Vec<PartitionExtent>,
    /// SHA-256 of the data file.
    pub checksum: Fingerprint,
    pub created_at: String,
}

impl MergedIndexMeta {
    /// Bytes per posting entry.
    pub fn entry_size(&self) -> usize {
        BYTES_PER_ID + self.code_size
    }

    /// Expected size of the data file in bytes.
    pub fn data_len(&self) -> u64 {
        self.vector_count * self.entry_size() as u64
    }

    /// Checks the extents are contiguous, cover every vector, and that the
    /// partition ranges tile the id space.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != MERGED_META_VERSION {
            return Err(format!(
                "unsupported metadata version {}, expected {MERGED_META_VERSION}",
                self.version
            ));
        }
        if self.cells.len() != self.nlist {
            return Err(format!(
                "{} cell extents for {} cells",
                self.cells.len(),
                self.nlist
            ));
        }
        let mut expected_offset = 0u64;
        for (cell, extent) in self.cells.iter().enumerate() {
            if extent.offset != expected_offset {
                return Err(format!(
                    "cell {cell} starts at entry {}, expected {expected_offset}",
                    extent.offset
                ));
            }
            expected_offset += extent.len;
        }
        if expected_offset != self.vector_count {
            return Err(format!(
                "cell extents hold {expected_offset} entries but the index has {} vectors",
                self.vector_count
            ));
        }
        let ranges: Vec<IdRange> = self.partitions.iter().map(|p| p.ids).collect();
        check_id_partition(&ranges, self.vector_count)
    }

    pub fn save(&self, path: &Path) -> IndexResult<()> {
        let json = self.to_json(path)?;
        write_atomically(path, |w| w.write_all(json.as_bytes()))
    }

    /// Loads metadata; anything unparsable is `IndexCorrupt`.
    pub fn load(path: &Path) -> IndexResult<Self> {
        let content = std::fs::read_to_string(path).read_context(path)?;
        serde_json::from_str(&content)
            .map_err(|e| IndexError::corrupt(path, format!("invalid metadata: {e}")))
    }

    fn to_json(&self, path: &Path) -> IndexResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| IndexError::Serialization {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Merges the segments of a build directory into one index.
#[derive(Debug, Clone)]
pub struct SegmentMerger {
    dir: PathBuf,
    codebook: Arc<Codebook>,
}

impl SegmentMerger {
    /// `dir` holds the segments and receives the merged files.
    pub fn new(dir: impl Into<PathBuf>, codebook: Arc<Codebook>) -> Self {
        Self {
            dir: dir.into(),
            codebook,
        }
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(MERGED_META_FILE)
    }

    /// Merges segments `0..expected_partitions` in ascending order.
    pub fn merge(&self, expected_partitions: usize) -> IndexResult<MergedIndexMeta> {
        let order: Vec<PartitionIndex> = (0..expected_partitions as u32)
            .map(PartitionIndex::new)
            .collect();
        self.merge_in_order(&order)
    }

    /// Merges segments visiting them in `order`, which must be a permutation
    /// of `0..order.len()`.
    pub fn merge_in_order(&self, order: &[PartitionIndex]) -> IndexResult<MergedIndexMeta> {
        check_permutation(order)?;

        for &partition in order {
            let path = segment_path(&self.dir, partition);
            if !path.exists() {
                return Err(IndexError::MergeMissingSegment { partition, path });
            }
        }

        let mut readers = Vec::with_capacity(order.len());
        for &partition in order {
            let reader = SegmentReader::open(&segment_path(&self.dir, partition))?;
            if reader.partition() != partition {
                return Err(IndexError::corrupt(
                    reader.path(),
                    format!("file holds partition {}", reader.partition()),
                ));
            }
            reader.check_codebook(&self.codebook)?;
            reader.check_ids()?;
            reader.check_codes(&self.codebook)?;
            readers.push(reader);
        }
        // Postings are written in ascending partition order whatever order
        // the segments were visited in.
        readers.sort_by_key(SegmentReader::partition);

        let mut partitions: Vec<PartitionExtent> = readers
            .iter()
            .map(|r| PartitionExtent {
                partition: r.partition(),
                ids: r.id_range(),
            })
            .collect();
        partitions.sort_by_key(|p| p.ids.start);
        let vector_count: u64 = readers.iter().map(SegmentReader::count).sum();
        let ranges: Vec<IdRange> = partitions.iter().map(|p| p.ids).collect();
        check_id_partition(&ranges, vector_count)
            .map_err(|reason| IndexError::corrupt(&self.dir, reason))?;

        info!(
            "Merging {} segments ({vector_count} vectors) into {}",
            readers.len(),
            self.dir.display()
        );

        let mut data = StagedFile::create_in(&self.dir)?;
        let mut hasher = Sha256::new();
        let mut cells = Vec::with_capacity(self.codebook.cell_count());
        {
            let mut writer = BufWriter::new(data.file_mut());
            let mut offset = 0u64;
            for cell in 0..self.codebook.cell_count() {
                let cell = CellId::new(cell as u32);
                let mut len = 0u64;
                for reader in &readers {
                    let bytes = reader.cell_bytes(cell);
                    writer.write_all(bytes).write_context(&self.dir)?;
                    hasher.update(bytes);
                    len += (bytes.len() / reader.entry_size()) as u64;
                }
                cells.push(CellExtent { offset, len });
                offset += len;
            }
            writer.flush().write_context(&self.dir)?;
        }

        let checksum = Fingerprint::from_bytes(hasher.finalize().into());
        let meta = MergedIndexMeta {
            version: MERGED_META_VERSION,
            data_file: merged_data_file_name(&checksum),
            fingerprint: self.codebook.fingerprint(),
            dimension: self.codebook.dimension().get(),
            nlist: self.codebook.cell_count(),
            code_size: self.codebook.code_size(),
            vector_count,
            cells,
            partitions,
            checksum,
            created_at: Utc::now().to_rfc3339(),
        };

        let meta_path = self.meta_path();
        let previous = MergedIndexMeta::load(&meta_path)
            .ok()
            .map(|m| m.data_file);
        let mut staged_meta = StagedFile::create(&meta_path)?;
        let json = meta.to_json(&meta_path)?;
        staged_meta
            .file_mut()
            .write_all(json.as_bytes())
            .write_context(&meta_path)?;

        publish(data, &meta.data_file, staged_meta)?;
        self.remove_stale_data(&meta.data_file, previous.as_deref());

        debug!(
            "Merged index {} with checksum {}",
            meta.fingerprint, meta.checksum
        );
        Ok(meta)
    }

    /// Deletes data files referenced by neither the new metadata nor the one
    /// it replaced. The replaced one stays for loaders that read the old
    /// metadata just before the swap.
    fn remove_stale_data(&self, current: &str, previous: Option<&str>) {
        let files = match merged_data_files(&self.dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("Cannot list merged data in {}: {e}", self.dir.display());
                return;
            }
        };
        for path in files {
            let name = path.file_name().and_then(|n| n.to_str());
            if name == Some(current) || name.is_some_and(|n| Some(n) == previous) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed stale data file {}", path.display()),
                Err(e) => warn!("Cannot remove stale data file {}: {e}", path.display()),
            }
        }
    }
}

/// Publishes the data file under `data_file`, then the metadata naming it.
///
/// Until the metadata rename succeeds the previous metadata, and the data
/// file it names, stay untouched. A failed metadata commit leaves the new
/// data file behind unreferenced; the next merge removes it.
fn publish(data: StagedFile, data_file: &str, meta: StagedFile) -> IndexResult<()> {
    data.commit_as(data_file)?;
    meta.commit()
}

fn check_permutation(order: &[PartitionIndex]) -> IndexResult<()> {
    let mut seen = vec![false; order.len()];
    for partition in order {
        match seen.get_mut(partition.get() as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => {
                return Err(IndexError::InvalidConfig {
                    reason: format!(
                        "merge order must visit partitions 0..{} exactly once, got {partition} out of place",
                        order.len()
                    ),
                });
            }
        }
    }
    Ok(())
}
