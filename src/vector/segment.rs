//! On-disk segments: the partial index built from one corpus partition.
//!
//! A segment is written once by its shard builder, published atomically and
//! never modified. The merger reads it through a memory map, so posting
//! lists are copied straight from the page cache into the merged file.
//!
//! # Storage Format
//!
//! ```text
//! Header (72 bytes):
//!   magic "CSEG" | version u32 | dimension u32 | partition u32
//!   base id u64 | vector count u64 | cell count u32 | code size u32
//!   codebook fingerprint [u8; 32]
//! Cell directory: cell count x (entry offset u64, entry count u64)
//! Postings, cell-major: entry = document id u64 (LE) | PQ code [code size]
//! ```

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use serde::Serialize;

use crate::error::{ErrorContext, IndexError, IndexResult};
use crate::vector::atomic::write_atomically;
use crate::vector::codebook::{Codebook, Fingerprint};
use crate::vector::types::{CellId, DocumentId, IdRange, PartitionIndex};

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
const HEADER_SIZE: usize = 72;

/// Magic bytes to identify segment files.
const MAGIC_BYTES: &[u8; 4] = b"CSEG";

/// Bytes per cell directory entry.
const DIRECTORY_ENTRY_SIZE: usize = 16;

/// Bytes per stored document id.
pub const BYTES_PER_ID: usize = 8;

/// Path of the segment for `partition` inside `dir`.
pub fn segment_path(dir: &Path, partition: PartitionIndex) -> PathBuf {
    dir.join(format!("segment_{}.seg", partition.get()))
}

/// What a finished shard build produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentSummary {
    pub partition: PartitionIndex,
    pub base_id: DocumentId,
    pub count: u64,
    pub path: PathBuf,
    /// True when an existing segment was reused instead of rebuilt.
    pub reused: bool,
}

impl SegmentSummary {
    pub fn id_range(&self) -> IdRange {
        IdRange::new(self.base_id, self.count)
    }
}

/// Accumulates one partition's postings, then writes the segment.
#[derive(Debug)]
pub struct SegmentWriter {
    partition: PartitionIndex,
    base_id: DocumentId,
    dimension: usize,
    code_size: usize,
    fingerprint: Fingerprint,
    cells: Vec<Vec<u8>>,
    count: u64,
}

impl SegmentWriter {
    pub fn new(partition: PartitionIndex, base_id: DocumentId, codebook: &Codebook) -> Self {
        Self {
            partition,
            base_id,
            dimension: codebook.dimension().get(),
            code_size: codebook.code_size(),
            fingerprint: codebook.fingerprint(),
            cells: vec![Vec::new(); codebook.cell_count()],
            count: 0,
        }
    }

    /// Appends a posting to `cell`.
    pub fn push(&mut self, cell: CellId, id: DocumentId, code: &[u8]) {
        debug_assert_eq!(code.len(), self.code_size);
        let list = &mut self.cells[cell.index()];
        list.extend_from_slice(&id.to_bytes());
        list.extend_from_slice(code);
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Writes the segment to `path` atomically.
    pub fn finish(self, path: &Path) -> IndexResult<SegmentSummary> {
        let entry_size = (BYTES_PER_ID + self.code_size) as u64;
        write_atomically(path, |w| {
            w.write_all(MAGIC_BYTES)?;
            w.write_all(&SEGMENT_VERSION.to_le_bytes())?;
            w.write_all(&(self.dimension as u32).to_le_bytes())?;
            w.write_all(&self.partition.to_bytes())?;
            w.write_all(&self.base_id.to_bytes())?;
            w.write_all(&self.count.to_le_bytes())?;
            w.write_all(&(self.cells.len() as u32).to_le_bytes())?;
            w.write_all(&(self.code_size as u32).to_le_bytes())?;
            w.write_all(self.fingerprint.as_bytes())?;

            let mut offset = 0u64;
            for list in &self.cells {
                let entries = list.len() as u64 / entry_size;
                w.write_all(&offset.to_le_bytes())?;
                w.write_all(&entries.to_le_bytes())?;
                offset += entries;
            }
            for list in &self.cells {
                w.write_all(list)?;
            }
            Ok(())
        })?;

        Ok(SegmentSummary {
            partition: self.partition,
            base_id: self.base_id,
            count: self.count,
            path: path.to_path_buf(),
            reused: false,
        })
    }
}

/// Read-only, memory-mapped view of a segment.
#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,
    mmap: Mmap,
    dimension: usize,
    partition: PartitionIndex,
    base_id: DocumentId,
    count: u64,
    cell_count: usize,
    code_size: usize,
    fingerprint: Fingerprint,
    data_start: usize,
}

impl SegmentReader {
    /// Maps a segment and validates its header and cell directory.
    ///
    /// A missing file is `FileRead`; a malformed one is `IndexCorrupt`.
    pub fn open(path: &Path) -> IndexResult<Self> {
        let file = File::open(path).read_context(path)?;
        let len = file.metadata().read_context(path)?.len() as usize;
        let corrupt = |reason: String| IndexError::corrupt(path, reason);
        if len < HEADER_SIZE {
            return Err(corrupt("file too small to contain a segment header".to_string()));
        }
        let mmap = unsafe { MmapOptions::new().map(&file) }.read_context(path)?;

        if &mmap[0..4] != MAGIC_BYTES {
            return Err(corrupt("invalid magic bytes".to_string()));
        }
        let version = read_u32(&mmap, 4);
        if version != SEGMENT_VERSION {
            return Err(corrupt(format!(
                "unsupported segment version {version}, expected {SEGMENT_VERSION}"
            )));
        }
        let dimension = read_u32(&mmap, 8) as usize;
        let partition = PartitionIndex::new(read_u32(&mmap, 12));
        let base_id = DocumentId::new(read_u64(&mmap, 16));
        let count = read_u64(&mmap, 24);
        let cell_count = read_u32(&mmap, 32) as usize;
        let code_size = read_u32(&mmap, 36) as usize;
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&mmap[40..72]);

        let data_start = HEADER_SIZE + cell_count * DIRECTORY_ENTRY_SIZE;
        let entry_size = BYTES_PER_ID + code_size;
        let expected_len = (count as usize)
            .checked_mul(entry_size)
            .and_then(|data| data.checked_add(data_start));
        if expected_len != Some(len) {
            return Err(corrupt(format!(
                "file is {len} bytes but the header describes {count} entries in {cell_count} cells"
            )));
        }

        let reader = Self {
            path: path.to_path_buf(),
            mmap,
            dimension,
            partition,
            base_id,
            count,
            cell_count,
            code_size,
            fingerprint: Fingerprint::from_bytes(fingerprint),
            data_start,
        };
        reader.validate_directory()?;
        Ok(reader)
    }

    /// Directory extents must tile the postings region in cell order.
    fn validate_directory(&self) -> IndexResult<()> {
        let mut next = 0u64;
        for cell in 0..self.cell_count {
            let (offset, entries) = self.extent(cell);
            if offset != next {
                return Err(IndexError::corrupt(
                    &self.path,
                    format!("cell {cell} starts at entry {offset}, expected {next}"),
                ));
            }
            next += entries;
        }
        if next != self.count {
            return Err(IndexError::corrupt(
                &self.path,
                format!("cell directory holds {next} entries, header says {}", self.count),
            ));
        }
        Ok(())
    }

    fn extent(&self, cell: usize) -> (u64, u64) {
        let at = HEADER_SIZE + cell * DIRECTORY_ENTRY_SIZE;
        (read_u64(&self.mmap, at), read_u64(&self.mmap, at + 8))
    }

    /// Checks that this segment was built with `codebook`.
    pub fn check_codebook(&self, codebook: &Codebook) -> IndexResult<()> {
        if self.fingerprint != codebook.fingerprint() {
            return Err(IndexError::corrupt(
                &self.path,
                format!(
                    "segment was built with codebook {}, current codebook is {}",
                    self.fingerprint,
                    codebook.fingerprint()
                ),
            ));
        }
        if self.dimension != codebook.dimension().get()
            || self.cell_count != codebook.cell_count()
            || self.code_size != codebook.code_size()
        {
            return Err(IndexError::corrupt(
                &self.path,
                "segment layout disagrees with the codebook",
            ));
        }
        Ok(())
    }

    /// Checks every stored id lies in this segment's id range.
    pub fn check_ids(&self) -> IndexResult<()> {
        let range = self.id_range();
        for cell in 0..self.cell_count {
            for (id, _) in self.postings(CellId::new(cell as u32)) {
                if !range.contains(id) {
                    return Err(IndexError::corrupt(
                        &self.path,
                        format!(
                            "id {id} in cell {cell} is outside [{}, {})",
                            range.start,
                            range.end()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Checks every stored PQ code names a codeword of `codebook`.
    pub fn check_codes(&self, codebook: &Codebook) -> IndexResult<()> {
        let pq = codebook.quantizer();
        for cell in 0..self.cell_count {
            for (id, code) in self.postings(CellId::new(cell as u32)) {
                pq.check_codes(code).map_err(|reason| {
                    IndexError::corrupt(&self.path, format!("id {id} in cell {cell}: {reason}"))
                })?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition(&self) -> PartitionIndex {
        self.partition
    }

    pub fn base_id(&self) -> DocumentId {
        self.base_id
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn id_range(&self) -> IdRange {
        IdRange::new(self.base_id, self.count)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Bytes per posting entry.
    pub fn entry_size(&self) -> usize {
        BYTES_PER_ID + self.code_size
    }

    /// Raw posting bytes of `cell`.
    pub fn cell_bytes(&self, cell: CellId) -> &[u8] {
        let (offset, entries) = self.extent(cell.index());
        let start = self.data_start + offset as usize * self.entry_size();
        let end = start + entries as usize * self.entry_size();
        &self.mmap[start..end]
    }

    /// Decoded postings of `cell`.
    pub fn postings(&self, cell: CellId) -> impl Iterator<Item = (DocumentId, &[u8])> + '_ {
        self.cell_bytes(cell)
            .chunks_exact(self.entry_size())
            .map(split_entry)
    }
}

/// Splits a raw posting entry into its id and code.
pub fn split_entry(entry: &[u8]) -> (DocumentId, &[u8]) {
    let mut id = [0u8; BYTES_PER_ID];
    id.copy_from_slice(&entry[..BYTES_PER_ID]);
    (DocumentId::from_bytes(id), &entry[BYTES_PER_ID..])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
