//! Test: partition id ranges tile the corpus
//!
//! Whatever the partition size, partition p owns the ids right after
//! partition p-1, the last one may be short, and the merged index holds
//! every id exactly once.

use crate::common::{TestIndex, factory, mock_encoder};
use codesearch_index::{IndexPipeline, Settings};
use codesearch_index::vector::{DocumentId, IdRange, check_id_partition};

const CORPUS_SIZE: usize = 23;

fn settings_with_partition_size(test: &TestIndex, partition_size: usize) -> Settings {
    let mut settings = Settings::default();
    settings.output_dir = test.index_dir();
    settings.build.workers = 4;
    settings.build.partition_size = partition_size;
    settings.build.sub_batch_size = 3;
    settings.build.train_sample_size = Some(CORPUS_SIZE);
    settings.training.cells = 2;
    settings.training.subspaces = 4;
    settings.training.bits_per_subspace = 4;
    settings.search.nprobe = 2;
    settings
}

#[test]
fn test_partition_ranges_cover_every_id_once() {
    let docs: Vec<(String, String)> = (0..CORPUS_SIZE)
        .map(|i| (format!("doc_{i}"), format!("fn handler_{i}() {{ route({i}) }}")))
        .collect();

    for partition_size in [1, 4, 7, 10, CORPUS_SIZE, 100] {
        println!("\n=== Partition size {partition_size} ===");
        let test = TestIndex::new();
        let corpus = test.write_corpus("corpus.jsonl", &docs);
        let mut pipeline = IndexPipeline::new(
            settings_with_partition_size(&test, partition_size),
            factory(mock_encoder(8)),
        )
        .unwrap();
        let report = pipeline.run(&corpus).unwrap();

        let expected_partitions = CORPUS_SIZE.div_ceil(partition_size);
        assert_eq!(report.segments.len(), expected_partitions);
        assert_eq!(report.meta.partitions.len(), expected_partitions);

        for (p, extent) in report.meta.partitions.iter().enumerate() {
            let start = (p * partition_size) as u64;
            let len = partition_size.min(CORPUS_SIZE - p * partition_size) as u64;
            assert_eq!(extent.partition.get() as usize, p);
            assert_eq!(extent.ids, IdRange::new(DocumentId::new(start), len));
        }
        let ranges: Vec<IdRange> = report.meta.partitions.iter().map(|p| p.ids).collect();
        check_id_partition(&ranges, CORPUS_SIZE as u64).unwrap();

        let engine = pipeline.open_engine().unwrap();
        let query = vec![1.0 / 8f32.sqrt(); 8];
        let hits = engine.search(&query, CORPUS_SIZE, None).unwrap();
        let mut ids: Vec<u64> = hits.iter().map(|h| h.id.get()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..CORPUS_SIZE as u64).collect::<Vec<_>>());
        println!("✓ {expected_partitions} partitions tile 0..{CORPUS_SIZE}");
    }
}
