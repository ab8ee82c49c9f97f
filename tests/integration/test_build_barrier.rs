//! Test: shard failures, resume and merge order
//!
//! A partition whose texts the encoder cannot embed fails on its own: the
//! other partitions still get their segments, nothing is merged, and a
//! resumed build only redoes the failed partition. Merging the same
//! segments in a different order yields the same index.

use crate::common::{TestIndex, docs_for, factory, precomputed, small_settings, sphere_points};
use codesearch_index::vector::{
    BuildState, DocumentId, PartitionIndex, PrecomputedEmbeddings, QueryEngine, SegmentMerger,
    VectorDimension,
};
use codesearch_index::{IndexError, IndexPipeline};
use std::sync::Arc;

/// Encoder that knows every vector except `v_15`, which sits in partition 1.
fn encoder_missing_v15(vectors: &[Vec<f32>]) -> Arc<PrecomputedEmbeddings> {
    let mut table = PrecomputedEmbeddings::new(VectorDimension::new(3).unwrap());
    for (i, v) in vectors.iter().enumerate() {
        if i != 15 {
            table.insert(format!("v_{i}"), v.clone());
        }
    }
    Arc::new(table)
}

#[test]
fn test_failed_partition_blocks_merge_but_not_siblings() {
    println!("\n=== Barrier: partition 1 cannot be encoded ===");
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    let corpus = test.write_corpus("corpus.jsonl", &docs_for(&vectors));

    let mut settings = small_settings(&test.index_dir());
    // Train on partition 0 only so training never sees v_15.
    settings.build.train_sample_size = Some(10);
    let mut pipeline = IndexPipeline::new(settings, factory(encoder_missing_v15(&vectors))).unwrap();

    let result = pipeline.run(&corpus);
    let Err(IndexError::PartitionsFailed { failures }) = result else {
        panic!("expected PartitionsFailed, got {result:?}");
    };
    println!("Failures: {failures:?}");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].partition, PartitionIndex::new(1));
    assert!(matches!(
        failures[0].error,
        IndexError::ShardEncodingFailure { partition, .. } if partition == PartitionIndex::new(1)
    ));

    let layout = pipeline.layout();
    assert!(layout.segment(PartitionIndex::new(0)).exists());
    assert!(!layout.segment(PartitionIndex::new(1)).exists());
    assert!(layout.segment(PartitionIndex::new(2)).exists());
    assert!(layout.merged_data_files().unwrap().is_empty());
    assert!(!layout.merged_meta().exists());
    assert_eq!(pipeline.state(), BuildState::ShardsBuilding);
    println!("✓ Siblings finished, no merged index written");

    let codebook = pipeline.load_codebook().unwrap();
    let merge = SegmentMerger::new(layout.root(), codebook).merge(3);
    assert!(matches!(
        merge,
        Err(IndexError::MergeMissingSegment { partition, .. }) if partition == PartitionIndex::new(1)
    ));
    assert!(!layout.merged_meta().exists());
}

#[test]
fn test_resume_rebuilds_only_missing_partitions() {
    println!("\n=== Resume after a failed partition ===");
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    let corpus = test.write_corpus("corpus.jsonl", &docs_for(&vectors));

    let mut settings = small_settings(&test.index_dir());
    settings.build.train_sample_size = Some(10);

    let mut failing =
        IndexPipeline::new(settings.clone(), factory(encoder_missing_v15(&vectors))).unwrap();
    assert!(failing.run(&corpus).is_err());
    let first_codebook = failing.load_codebook().unwrap().fingerprint();

    settings.build.resume = true;
    let mut resumed = IndexPipeline::new(settings, factory(precomputed(&vectors, &[]))).unwrap();
    let report = resumed.run(&corpus).unwrap();

    assert_eq!(report.codebook, first_codebook, "codebook should be reused");
    assert_eq!(report.reused_segments(), 2);
    let rebuilt: Vec<_> = report
        .segments
        .iter()
        .filter(|s| !s.reused)
        .map(|s| s.partition)
        .collect();
    assert_eq!(rebuilt, vec![PartitionIndex::new(1)]);
    assert_eq!(report.meta.vector_count, 30);
    println!("✓ Only partition 1 was rebuilt");

    let engine = resumed.open_engine().unwrap();
    let hits = engine.search(&vectors[15], 30, None).unwrap();
    assert_eq!(hits.len(), 30);
    assert!(hits.iter().any(|h| h.id == DocumentId::new(15)));
}

#[test]
fn test_merge_order_does_not_change_the_index() {
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    let corpus = test.write_corpus("corpus.jsonl", &docs_for(&vectors));

    let mut pipeline =
        IndexPipeline::new(small_settings(&test.index_dir()), factory(precomputed(&vectors, &[])))
            .unwrap();
    let report = pipeline.run(&corpus).unwrap();
    let before = QueryEngine::load(&test.index_dir(), 2).unwrap();
    let answers_before = before.search_batch(&vectors, 5, None).unwrap();
    drop(before);

    let codebook = pipeline.load_codebook().unwrap();
    let merger = SegmentMerger::new(pipeline.layout().root(), codebook);
    let reordered = merger
        .merge_in_order(&[
            PartitionIndex::new(2),
            PartitionIndex::new(0),
            PartitionIndex::new(1),
        ])
        .unwrap();

    assert_eq!(reordered.checksum, report.meta.checksum);
    assert_eq!(reordered.cells, report.meta.cells);
    assert_eq!(reordered.partitions, report.meta.partitions);

    let after = QueryEngine::load(&test.index_dir(), 2).unwrap();
    let answers_after = after.search_batch(&vectors, 5, None).unwrap();
    assert_eq!(answers_before, answers_after);
}
