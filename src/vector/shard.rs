//! Shard building: encode one partition and write its segment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::vector::codebook::Codebook;
use crate::vector::corpus::Partition;
use crate::vector::embedding::EncoderContext;
use crate::vector::segment::{SegmentReader, SegmentSummary, SegmentWriter, segment_path};
use crate::vector::types::DocumentId;

/// One unit of work for the worker pool.
#[derive(Debug, Clone)]
pub struct PartitionTask {
    pub partition: Partition,
    pub codebook: Arc<Codebook>,
    /// Directory receiving `segment_{i}.seg`.
    pub output_dir: PathBuf,
}

impl PartitionTask {
    pub fn segment_path(&self) -> PathBuf {
        segment_path(&self.output_dir, self.partition.index)
    }
}

/// Encodes partitions into segments.
#[derive(Debug, Clone)]
pub struct ShardBuilder {
    sub_batch_size: usize,
}

impl ShardBuilder {
    pub fn new(sub_batch_size: usize) -> Self {
        Self {
            sub_batch_size: sub_batch_size.max(1),
        }
    }

    /// Builds the segment of `task.partition` with the worker's encoder.
    ///
    /// Ids are assigned sequentially from the partition's base id in item
    /// order. The only file written is the partition's own segment, and only
    /// once every item has been encoded.
    pub fn build(&self, task: &PartitionTask, ctx: &EncoderContext) -> IndexResult<SegmentSummary> {
        let partition = &task.partition;
        let codebook = task.codebook.as_ref();
        if ctx.dimension() != codebook.dimension() {
            return Err(IndexError::EncodingContractViolation {
                partition: Some(partition.index),
                reason: format!(
                    "encoder produces dimension {} but the codebook expects {}",
                    ctx.dimension().get(),
                    codebook.dimension().get()
                ),
            });
        }

        let mut writer = SegmentWriter::new(partition.index, partition.base_id, codebook);
        let mut code = vec![0u8; codebook.code_size()];
        let mut next_id = partition.base_id.get();

        for (batch_number, batch) in partition.items.chunks(self.sub_batch_size).enumerate() {
            let texts: Vec<&str> = batch.iter().map(String::as_str).collect();
            let vectors = ctx.encode_batch(&texts, Some(partition.index))?;
            for vector in &vectors {
                let cell = codebook.encode_into(vector, &mut code);
                writer.push(cell, DocumentId::new(next_id), &code);
                next_id += 1;
            }
            debug!(
                "Partition {}: encoded sub-batch {batch_number} ({} items) on {}",
                partition.index,
                batch.len(),
                ctx.device()
            );
        }

        writer.finish(&task.segment_path())
    }
}

/// Returns the existing segment for `partition` if it can be reused as is:
/// readable, built with `codebook`, holding only its codewords, and covering
/// exactly the partition's ids.
pub fn reusable_segment(
    output_dir: &Path,
    partition: &Partition,
    codebook: &Codebook,
) -> Option<SegmentSummary> {
    let path = segment_path(output_dir, partition.index);
    if !path.exists() {
        return None;
    }
    let reader = match SegmentReader::open(&path) {
        Ok(reader) => reader,
        Err(e) => {
            debug!("Not reusing {}: {e}", path.display());
            return None;
        }
    };
    let matches = reader.check_codebook(codebook).is_ok()
        && reader.check_codes(codebook).is_ok()
        && reader.partition() == partition.index
        && reader.base_id() == partition.base_id
        && reader.count() == partition.items.len() as u64;
    matches.then(|| SegmentSummary {
        partition: partition.index,
        base_id: partition.base_id,
        count: reader.count(),
        path,
        reused: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::vector::embedding::{DeviceHandle, MockEmbeddingGenerator};
    use crate::vector::trainer::IndexTrainer;
    use crate::vector::types::{CellId, PartitionIndex, VectorDimension};
    use crate::vector::{EmbeddingGenerator, VectorError};
    use tempfile::TempDir;

    /// Mock encoder that doubles the vector of one text, breaking unit norm.
    struct StretchesOne {
        inner: MockEmbeddingGenerator,
        text: &'static str,
    }

    impl EmbeddingGenerator for StretchesOne {
        fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
            let mut vectors = self.inner.generate_embeddings(texts)?;
            for (text, vector) in texts.iter().zip(vectors.iter_mut()) {
                if *text == self.text {
                    vector.iter_mut().for_each(|x| *x *= 2.0);
                }
            }
            Ok(vectors)
        }

        fn dimension(&self) -> VectorDimension {
            self.inner.dimension()
        }
    }

    fn setup() -> (Arc<Codebook>, EncoderContext) {
        let generator = MockEmbeddingGenerator::with_dimension(VectorDimension::new(8).unwrap());
        let texts: Vec<String> = (0..40).map(|i| format!("sample {i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let sample = generator.generate_embeddings(&refs).unwrap();
        let trainer = IndexTrainer::new(TrainingConfig {
            cells: 4,
            subspaces: 2,
            bits_per_subspace: 4,
            ..TrainingConfig::default()
        });
        let codebook = Arc::new(trainer.train(&sample).unwrap());
        (codebook, EncoderContext::new(DeviceHandle::Cpu, Arc::new(generator)))
    }

    fn task(dir: &Path, codebook: &Arc<Codebook>, index: u32, base: u64, n: usize) -> PartitionTask {
        PartitionTask {
            partition: Partition {
                index: PartitionIndex::new(index),
                base_id: DocumentId::new(base),
                items: (0..n).map(|i| format!("item {}", base + i as u64)).collect(),
            },
            codebook: Arc::clone(codebook),
            output_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_build_assigns_ids_from_base() {
        let temp = TempDir::new().unwrap();
        let (codebook, ctx) = setup();
        let task = task(temp.path(), &codebook, 1, 10, 7);

        let summary = ShardBuilder::new(3).build(&task, &ctx).unwrap();
        assert_eq!(summary.count, 7);
        assert!(!summary.reused);

        let reader = SegmentReader::open(&summary.path).unwrap();
        let mut ids: Vec<u64> = (0..codebook.cell_count())
            .flat_map(|c| {
                reader
                    .postings(CellId::new(c as u32))
                    .map(|(id, _)| id.get())
                    .collect::<Vec<_>>()
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (10..17).collect::<Vec<u64>>());
    }

    #[test]
    fn test_dimension_mismatch_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let (codebook, _) = setup();
        let wrong = EncoderContext::new(
            DeviceHandle::Cpu,
            Arc::new(MockEmbeddingGenerator::with_dimension(VectorDimension::new(6).unwrap())),
        );
        let task = task(temp.path(), &codebook, 0, 0, 3);

        assert!(matches!(
            ShardBuilder::new(2).build(&task, &wrong),
            Err(IndexError::EncodingContractViolation { .. })
        ));
        assert!(!task.segment_path().exists());
    }

    #[test]
    fn test_non_unit_vectors_fail_the_partition() {
        let temp = TempDir::new().unwrap();
        let (codebook, _) = setup();
        let stretched = EncoderContext::new(
            DeviceHandle::Cpu,
            Arc::new(StretchesOne {
                inner: MockEmbeddingGenerator::with_dimension(VectorDimension::new(8).unwrap()),
                text: "item 12",
            }),
        );
        // Sub-batches [10, 11], [12, 13], [14]: the first one encodes fine.
        let task = task(temp.path(), &codebook, 5, 10, 5);

        match ShardBuilder::new(2).build(&task, &stretched) {
            Err(IndexError::EncodingContractViolation { partition, reason }) => {
                assert_eq!(partition, Some(PartitionIndex::new(5)));
                println!("Rejected: {reason}");
            }
            other => panic!("expected EncodingContractViolation, got {other:?}"),
        }
        assert!(!task.segment_path().exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_reusable_segment_requires_exact_match() {
        let temp = TempDir::new().unwrap();
        let (codebook, ctx) = setup();
        let built = task(temp.path(), &codebook, 2, 20, 5);
        ShardBuilder::new(4).build(&built, &ctx).unwrap();

        let reused = reusable_segment(temp.path(), &built.partition, &codebook).unwrap();
        assert!(reused.reused);
        assert_eq!(reused.count, 5);

        let longer = task(temp.path(), &codebook, 2, 20, 6);
        assert!(reusable_segment(temp.path(), &longer.partition, &codebook).is_none());

        let shifted = task(temp.path(), &codebook, 2, 21, 5);
        assert!(reusable_segment(temp.path(), &shifted.partition, &codebook).is_none());

        let missing = task(temp.path(), &codebook, 3, 25, 5);
        assert!(reusable_segment(temp.path(), &missing.partition, &codebook).is_none());
    }
}
