//! Query engine over a merged IVF-PQ index.
//!
//! The engine is immutable once loaded. Queries take `&self`, so a single
//! engine serves any number of threads. New index versions are published by
//! swapping the `Arc` held in an [`IndexHandle`]; queries already running
//! finish on the engine they started with.
//!
//! # Scoring
//!
//! For a probed cell `c` with centroid `C`, a stored vector is approximated by
//! `C + r̂` where `r̂` is its decoded residual, so
//! `<q, v> ≈ <q, C> + <q, r̂>`. The second term comes from a per-query lookup
//! table, one row per PQ subspace. Distance is `1 - <q, v>`.

use std::collections::BinaryHeap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{IndexError, IndexResult};
use crate::vector::codebook::{Codebook, Fingerprint};
use crate::vector::corpus::{ExternalId, IdMapping};
use crate::vector::embedding::EncoderContext;
use crate::vector::layout::IndexLayout;
use crate::vector::merge::MergedIndexMeta;
use crate::vector::segment::split_entry;
use crate::vector::types::{DocumentId, SearchHit};

/// A loaded, read-only merged index.
#[derive(Debug)]
pub struct QueryEngine {
    layout: IndexLayout,
    meta: MergedIndexMeta,
    codebook: Arc<Codebook>,
    data: Mmap,
    nprobe: usize,
}

impl QueryEngine {
    /// Loads the merged index in `dir`, probing `nprobe` cells by default.
    ///
    /// Every artifact is verified before the engine is returned: metadata
    /// extents, codebook fingerprint, data file length and checksum, and
    /// that each stored code names a trained codeword. Any problem,
    /// including a missing file, is `IndexCorrupt`.
    pub fn load(dir: &Path, nprobe: usize) -> IndexResult<Self> {
        let layout = IndexLayout::new(dir);
        let meta_path = layout.merged_meta();
        let meta = MergedIndexMeta::load(&meta_path).map_err(|e| as_corrupt(&meta_path, e))?;
        meta.validate()
            .map_err(|reason| IndexError::corrupt(&meta_path, reason))?;

        let codebook_path = layout.codebook();
        let codebook = Codebook::load(&codebook_path).map_err(|e| as_corrupt(&codebook_path, e))?;
        if codebook.fingerprint() != meta.fingerprint {
            return Err(IndexError::corrupt(
                &meta_path,
                format!(
                    "index was merged with codebook {}, found {}",
                    meta.fingerprint,
                    codebook.fingerprint()
                ),
            ));
        }
        if codebook.dimension().get() != meta.dimension
            || codebook.cell_count() != meta.nlist
            || codebook.code_size() != meta.code_size
        {
            return Err(IndexError::corrupt(
                &meta_path,
                "metadata layout disagrees with the codebook",
            ));
        }

        let data_path = layout.root().join(&meta.data_file);
        let data = map_data(&data_path, &meta)?;
        check_codes(&data_path, &data, &meta, &codebook)?;

        info!(
            "Loaded index {} ({} vectors, {} cells) from {}",
            meta.fingerprint,
            meta.vector_count,
            meta.nlist,
            dir.display()
        );

        Ok(Self {
            layout,
            meta,
            codebook: Arc::new(codebook),
            data,
            nprobe: nprobe.max(1),
        })
    }

    /// The `k` nearest stored vectors to `query`, closest first, ties by lower id.
    ///
    /// Probes `nprobe` cells, or the load-time default when `None`, clamped
    /// to `[1, nlist]`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        nprobe: Option<usize>,
    ) -> IndexResult<Vec<SearchHit>> {
        let expected = self.meta.dimension;
        if query.len() != expected {
            return Err(IndexError::QueryDimensionMismatch {
                expected,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let pq = self.codebook.quantizer();
        let table = pq.inner_product_table(query);
        let entry_size = self.meta.entry_size();
        let mut heap: BinaryHeap<SearchHit> = BinaryHeap::with_capacity(k + 1);

        for (cell, coarse_score) in self
            .codebook
            .probe_cells(query, nprobe.unwrap_or(self.nprobe))
        {
            for entry in self.cell_bytes(cell.index()).chunks_exact(entry_size) {
                let (id, code) = split_entry(entry);
                let hit = SearchHit {
                    id,
                    distance: 1.0 - (coarse_score + pq.table_score(&table, code)),
                };
                if heap.len() < k {
                    heap.push(hit);
                } else if heap.peek().is_some_and(|worst| hit < *worst) {
                    heap.pop();
                    heap.push(hit);
                }
            }
        }

        let mut hits = heap.into_vec();
        hits.sort_by(SearchHit::rank_cmp);
        Ok(hits)
    }

    /// Answers many queries in parallel; results are in query order.
    pub fn search_batch(
        &self,
        queries: &[Vec<f32>],
        k: usize,
        nprobe: Option<usize>,
    ) -> IndexResult<Vec<Vec<SearchHit>>> {
        queries
            .par_iter()
            .map(|q| self.search(q, k, nprobe))
            .collect()
    }

    /// Like [`search`](Self::search), reporting external ids from `mapping`.
    pub fn search_external(
        &self,
        query: &[f32],
        k: usize,
        nprobe: Option<usize>,
        mapping: &IdMapping,
    ) -> IndexResult<Vec<ExternalHit>> {
        self.check_mapping(mapping)?;
        let hits = self.search(query, k, nprobe)?;
        Ok(resolve(&hits, Some(mapping)))
    }

    /// Fails unless `mapping` has exactly one entry per indexed vector.
    pub fn check_mapping(&self, mapping: &IdMapping) -> IndexResult<()> {
        if mapping.len() as u64 != self.meta.vector_count {
            return Err(IndexError::IdMappingMismatch {
                mapping: mapping.len(),
                indexed: self.meta.vector_count,
            });
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.meta.dimension
    }

    pub fn nlist(&self) -> usize {
        self.meta.nlist
    }

    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    pub fn len(&self) -> u64 {
        self.meta.vector_count
    }

    pub fn is_empty(&self) -> bool {
        self.meta.vector_count == 0
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.meta.fingerprint
    }

    pub fn meta(&self) -> &MergedIndexMeta {
        &self.meta
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    fn cell_bytes(&self, cell: usize) -> &[u8] {
        let extent = self.meta.cells[cell];
        let entry_size = self.meta.entry_size();
        let start = extent.offset as usize * entry_size;
        &self.data[start..start + extent.len as usize * entry_size]
    }
}

fn map_data(path: &Path, meta: &MergedIndexMeta) -> IndexResult<Mmap> {
    let corrupt = |reason: String| IndexError::corrupt(path, reason);
    if meta.vector_count == 0 {
        return Err(corrupt("index holds no vectors".to_string()));
    }
    let file = File::open(path).map_err(|e| corrupt(format!("cannot open data file: {e}")))?;
    let len = file
        .metadata()
        .map_err(|e| corrupt(format!("cannot stat data file: {e}")))?
        .len();
    if len != meta.data_len() {
        return Err(corrupt(format!(
            "data file is {len} bytes, metadata describes {}",
            meta.data_len()
        )));
    }
    let data = unsafe { MmapOptions::new().map(&file) }
        .map_err(|e| corrupt(format!("cannot map data file: {e}")))?;
    let checksum = Fingerprint::of(&data);
    if checksum != meta.checksum {
        return Err(corrupt(format!(
            "checksum {checksum} does not match recorded {}",
            meta.checksum
        )));
    }
    Ok(data)
}

fn check_codes(
    path: &Path,
    data: &[u8],
    meta: &MergedIndexMeta,
    codebook: &Codebook,
) -> IndexResult<()> {
    let pq = codebook.quantizer();
    for (n, entry) in data.chunks_exact(meta.entry_size()).enumerate() {
        let (id, code) = split_entry(entry);
        pq.check_codes(code).map_err(|reason| {
            IndexError::corrupt(path, format!("entry {n} (id {id}): {reason}"))
        })?;
    }
    Ok(())
}

fn as_corrupt(path: &Path, error: IndexError) -> IndexError {
    match error {
        IndexError::IndexCorrupt { .. } => error,
        other => IndexError::corrupt(path, other.to_string()),
    }
}

/// A hit reported with its external id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalHit {
    pub id: ExternalId,
    pub internal_id: DocumentId,
    pub distance: f32,
}

/// Translates hits; without a mapping the internal id is reported.
pub fn resolve(hits: &[SearchHit], mapping: Option<&IdMapping>) -> Vec<ExternalHit> {
    hits.iter()
        .map(|hit| {
            let id = mapping
                .and_then(|m| m.get(hit.id).cloned())
                .unwrap_or(ExternalId::Int(hit.id.get() as i64));
            ExternalHit {
                id,
                internal_id: hit.id,
                distance: hit.distance,
            }
        })
        .collect()
}

/// The currently served engine, replaceable while queries run.
#[derive(Debug)]
pub struct IndexHandle {
    current: RwLock<Arc<QueryEngine>>,
}

impl IndexHandle {
    pub fn new(engine: QueryEngine) -> Self {
        Self {
            current: RwLock::new(Arc::new(engine)),
        }
    }

    /// Loads the index in `dir`.
    pub fn open(dir: &Path, nprobe: usize) -> IndexResult<Self> {
        Ok(Self::new(QueryEngine::load(dir, nprobe)?))
    }

    /// The engine new queries should use.
    pub fn current(&self) -> Arc<QueryEngine> {
        Arc::clone(&self.current.read())
    }

    /// Publishes `engine`, returning the one it replaced.
    pub fn swap(&self, engine: QueryEngine) -> Arc<QueryEngine> {
        let engine = Arc::new(engine);
        std::mem::replace(&mut *self.current.write(), engine)
    }

    /// Reloads the served directory. On failure the current engine stays.
    pub fn reload(&self) -> IndexResult<Arc<QueryEngine>> {
        let current = self.current();
        let engine = QueryEngine::load(current.root(), current.nprobe())?;
        debug!(
            "Swapping index {} for {}",
            current.fingerprint(),
            engine.fingerprint()
        );
        self.swap(engine);
        Ok(self.current())
    }
}

/// Text in, external ids out: the query surface for a serving layer.
///
/// A mapping loaded from disk is re-read when a swapped-in index no longer
/// matches it.
pub struct QueryService {
    handle: Arc<IndexHandle>,
    encoder: EncoderContext,
    mapping: RwLock<Option<Arc<IdMapping>>>,
    mapping_path: Option<PathBuf>,
}

impl QueryService {
    pub fn new(handle: Arc<IndexHandle>, encoder: EncoderContext) -> Self {
        Self {
            handle,
            encoder,
            mapping: RwLock::new(None),
            mapping_path: None,
        }
    }

    #[must_use]
    pub fn with_mapping(self, mapping: IdMapping) -> Self {
        *self.mapping.write() = Some(Arc::new(mapping));
        self
    }

    /// Loads the id mapping stored next to the index, if there is one.
    pub fn with_mapping_from(mut self, path: &Path) -> IndexResult<Self> {
        self.mapping_path = Some(path.to_path_buf());
        if !path.exists() {
            debug!("No id mapping at {}", path.display());
            return Ok(self);
        }
        let mapping = IdMapping::load(path)?;
        Ok(self.with_mapping(mapping))
    }

    pub fn handle(&self) -> &Arc<IndexHandle> {
        &self.handle
    }

    /// Encodes `text` and returns its `k` nearest documents.
    pub fn search_text(&self, text: &str, k: usize) -> IndexResult<Vec<ExternalHit>> {
        let engine = self.handle.current();
        let query = self
            .encoder
            .encode_batch(&[text], None)?
            .pop()
            .ok_or_else(|| IndexError::Encoder("encoder returned no vector".to_string()))?;

        match self.mapping_for(&engine)? {
            Some(mapping) => engine.search_external(&query, k, None, &mapping),
            None => Ok(resolve(&engine.search(&query, k, None)?, None)),
        }
    }

    fn mapping_for(&self, engine: &QueryEngine) -> IndexResult<Option<Arc<IdMapping>>> {
        let current = self.mapping.read().clone();
        let stale = current
            .as_ref()
            .is_none_or(|m| m.len() as u64 != engine.len());
        let Some(path) = self.mapping_path.as_ref().filter(|p| stale && p.exists()) else {
            return Ok(current);
        };

        info!("Index size changed, reloading id mapping {}", path.display());
        let mapping = Arc::new(IdMapping::load(path)?);
        *self.mapping.write() = Some(Arc::clone(&mapping));
        Ok(Some(mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::vector::embedding::{DeviceHandle, EmbeddingGenerator, MockEmbeddingGenerator};
    use crate::vector::merge::SegmentMerger;
    use crate::vector::segment::SegmentWriter;
    use crate::vector::trainer::IndexTrainer;
    use crate::vector::types::{PartitionIndex, VectorDimension};
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn generator() -> MockEmbeddingGenerator {
        MockEmbeddingGenerator::with_dimension(VectorDimension::new(DIM).unwrap())
    }

    fn vectors(n: usize) -> Vec<Vec<f32>> {
        let texts: Vec<String> = (0..n).map(|i| format!("doc {i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        generator().generate_embeddings(&refs).unwrap()
    }

    fn data_path(dir: &Path) -> PathBuf {
        let meta = MergedIndexMeta::load(&IndexLayout::new(dir).merged_meta()).unwrap();
        dir.join(meta.data_file)
    }

    /// Trains on all `n` vectors, writes one segment per 10 and merges.
    fn build_index(dir: &Path, n: usize) -> Vec<Vec<f32>> {
        let vectors = vectors(n);
        let layout = IndexLayout::new(dir);
        let trainer = IndexTrainer::new(TrainingConfig {
            cells: 2,
            subspaces: DIM,
            bits_per_subspace: 8,
            ..TrainingConfig::default()
        });
        let codebook = Arc::new(trainer.train_and_save(&vectors, &layout.codebook()).unwrap());

        let chunks: Vec<&[Vec<f32>]> = vectors.chunks(10).collect();
        for (p, chunk) in chunks.iter().enumerate() {
            let base = (p * 10) as u64;
            let partition = PartitionIndex::new(p as u32);
            let mut writer = SegmentWriter::new(partition, DocumentId::new(base), &codebook);
            for (j, v) in chunk.iter().enumerate() {
                let (cell, code) = codebook.encode(v);
                writer.push(cell, DocumentId::new(base + j as u64), &code);
            }
            writer.finish(&layout.segment(partition)).unwrap();
        }
        SegmentMerger::new(dir, codebook).merge(chunks.len()).unwrap();
        vectors
    }

    #[test]
    fn test_results_are_ranked() {
        let temp = TempDir::new().unwrap();
        let vectors = build_index(temp.path(), 40);
        let engine = QueryEngine::load(temp.path(), 2).unwrap();
        assert_eq!(engine.len(), 40);

        let hits = engine.search(&vectors[5], 10, None).unwrap();
        assert_eq!(hits.len(), 10);
        for pair in hits.windows(2) {
            assert_ne!(
                SearchHit::rank_cmp(&pair[0], &pair[1]),
                std::cmp::Ordering::Greater
            );
        }

        let all = engine.search(&vectors[5], 100, None).unwrap();
        assert_eq!(all.len(), 40, "probing every cell reaches every vector");
    }

    #[test]
    fn test_dimension_guard() {
        let temp = TempDir::new().unwrap();
        build_index(temp.path(), 20);
        let engine = QueryEngine::load(temp.path(), 1).unwrap();

        match engine.search(&[0.5; DIM - 1], 3, None) {
            Err(IndexError::QueryDimensionMismatch { expected, actual }) => {
                assert_eq!(expected, DIM);
                assert_eq!(actual, DIM - 1);
            }
            other => panic!("expected QueryDimensionMismatch, got {other:?}"),
        }
        assert!(engine.search(&[0.0; DIM], 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_nprobe_is_clamped() {
        let temp = TempDir::new().unwrap();
        let vectors = build_index(temp.path(), 20);
        let engine = QueryEngine::load(temp.path(), 1).unwrap();

        let wide = engine.search(&vectors[0], 20, Some(99)).unwrap();
        assert_eq!(wide.len(), 20);
        let none = engine.search(&vectors[0], 20, Some(0)).unwrap();
        assert!(!none.is_empty() && none.len() <= 20);
    }

    #[test]
    fn test_batch_matches_single_queries() {
        let temp = TempDir::new().unwrap();
        let vectors = build_index(temp.path(), 30);
        let engine = QueryEngine::load(temp.path(), 2).unwrap();

        let batch = engine.search_batch(&vectors[..4], 3, None).unwrap();
        for (query, hits) in vectors[..4].iter().zip(&batch) {
            assert_eq!(hits, &engine.search(query, 3, None).unwrap());
        }
    }

    #[test]
    fn test_corrupt_data_is_rejected() {
        let temp = TempDir::new().unwrap();
        build_index(temp.path(), 20);
        let data_path = data_path(temp.path());

        let mut data = std::fs::read(&data_path).unwrap();
        data[3] ^= 0xFF;
        std::fs::write(&data_path, &data).unwrap();
        assert!(matches!(
            QueryEngine::load(temp.path(), 1),
            Err(IndexError::IndexCorrupt { .. })
        ));

        data.pop();
        std::fs::write(&data_path, &data).unwrap();
        assert!(matches!(
            QueryEngine::load(temp.path(), 1),
            Err(IndexError::IndexCorrupt { .. })
        ));
    }

    #[test]
    fn test_unknown_codeword_is_rejected_at_load() {
        let temp = TempDir::new().unwrap();
        build_index(temp.path(), 20);
        let layout = IndexLayout::new(temp.path());
        let mut meta = MergedIndexMeta::load(&layout.merged_meta()).unwrap();
        let data_path = temp.path().join(&meta.data_file);

        // A well-formed file whose checksum is honest but whose last code
        // byte names a codeword the 20-vector codebook never trained.
        let mut data = std::fs::read(&data_path).unwrap();
        let last = data.len() - 1;
        data[last] = 0xFF;
        std::fs::write(&data_path, &data).unwrap();
        meta.checksum = Fingerprint::of(&data);
        meta.save(&layout.merged_meta()).unwrap();

        match QueryEngine::load(temp.path(), 1) {
            Err(IndexError::IndexCorrupt { reason, .. }) => {
                assert!(reason.contains("codewords"), "{reason}");
            }
            other => panic!("expected IndexCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_artifacts_are_corrupt() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            QueryEngine::load(temp.path(), 1),
            Err(IndexError::IndexCorrupt { .. })
        ));

        build_index(temp.path(), 20);
        std::fs::remove_file(IndexLayout::new(temp.path()).codebook()).unwrap();
        assert!(matches!(
            QueryEngine::load(temp.path(), 1),
            Err(IndexError::IndexCorrupt { .. })
        ));
    }

    #[test]
    fn test_external_ids_require_matching_mapping() {
        let temp = TempDir::new().unwrap();
        let vectors = build_index(temp.path(), 20);
        let engine = QueryEngine::load(temp.path(), 2).unwrap();

        let mapping = IdMapping::new((0..20).map(|i| ExternalId::Text(format!("fn_{i}"))).collect());
        let hits = engine.search_external(&vectors[3], 1, None, &mapping).unwrap();
        assert_eq!(hits[0].id, ExternalId::Text("fn_3".to_string()));
        assert_eq!(hits[0].internal_id, DocumentId::new(3));

        let short = IdMapping::new(vec![ExternalId::Int(0)]);
        assert!(matches!(
            engine.search_external(&vectors[3], 1, None, &short),
            Err(IndexError::IdMappingMismatch { .. })
        ));
    }

    #[test]
    fn test_swap_keeps_in_flight_engine() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        build_index(first.path(), 20);
        build_index(second.path(), 30);

        let handle = IndexHandle::open(first.path(), 2).unwrap();
        let in_flight = handle.current();
        let old = handle.swap(QueryEngine::load(second.path(), 2).unwrap());

        assert!(Arc::ptr_eq(&old, &in_flight));
        assert_eq!(in_flight.len(), 20);
        assert_eq!(handle.current().len(), 30);
        assert_eq!(handle.current().root(), second.path());
    }

    #[test]
    fn test_reload_failure_keeps_current() {
        let temp = TempDir::new().unwrap();
        build_index(temp.path(), 20);
        let handle = IndexHandle::open(temp.path(), 2).unwrap();

        std::fs::write(IndexLayout::new(temp.path()).merged_meta(), b"{").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.current().len(), 20);
    }

    #[test]
    fn test_query_service_encodes_text() {
        let temp = TempDir::new().unwrap();
        build_index(temp.path(), 20);
        let handle = Arc::new(IndexHandle::open(temp.path(), 2).unwrap());
        let service = QueryService::new(
            Arc::clone(&handle),
            EncoderContext::new(DeviceHandle::Cpu, Arc::new(generator())),
        );

        let hits = service.search_text("doc 11", 1).unwrap();
        assert_eq!(hits[0].id, ExternalId::Int(11));
    }
}
