//! File names of the artifacts inside an index directory.

use std::path::{Path, PathBuf};

use crate::vector::merge::{MERGED_META_FILE, MergedIndexMeta, merged_data_files};
use crate::vector::segment::segment_path;
use crate::vector::types::PartitionIndex;

pub const CODEBOOK_FILE: &str = "trained.index";
pub const ID_MAPPING_FILE: &str = "id_mapping.json";

/// Paths of every artifact of one index build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLayout {
    root: PathBuf,
}

impl IndexLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn codebook(&self) -> PathBuf {
        self.root.join(CODEBOOK_FILE)
    }

    pub fn segment(&self, partition: PartitionIndex) -> PathBuf {
        segment_path(&self.root, partition)
    }

    pub fn id_mapping(&self) -> PathBuf {
        self.root.join(ID_MAPPING_FILE)
    }

    /// Data file named by `meta`.
    pub fn merged_data(&self, meta: &MergedIndexMeta) -> PathBuf {
        self.root.join(&meta.data_file)
    }

    /// Every merged data file on disk, referenced or not.
    pub fn merged_data_files(&self) -> std::io::Result<Vec<PathBuf>> {
        merged_data_files(&self.root)
    }

    pub fn merged_meta(&self) -> PathBuf {
        self.root.join(MERGED_META_FILE)
    }

    /// Segment files present on disk, sorted by partition.
    pub fn existing_segments(&self) -> std::io::Result<Vec<PartitionIndex>> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return Ok(found);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let index = name
                .strip_prefix("segment_")
                .and_then(|rest| rest.strip_suffix(".seg"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(index) = index {
                found.push(PartitionIndex::new(index));
            }
        }
        found.sort();
        Ok(found)
    }
}
