//! Test: loading, validating and hot-swapping a served index
//!
//! Damaged artifacts must be refused with IndexCorrupt, and a rebuilt index
//! published into the served directory must replace the running one without
//! disturbing readers that still hold the old snapshot.

use crate::common::{TestIndex, docs_for, factory, precomputed, small_settings, sphere_points};
use codesearch_index::vector::{
    DeviceHandle, EncoderContext, ExternalId, IndexHandle, IndexLayout, IndexWatcher,
    MergedIndexMeta, QueryEngine, QueryService,
};
use codesearch_index::{IndexError, IndexPipeline};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn build(test: &TestIndex, vectors: &[Vec<f32>], seed: u64) {
    let corpus = test.write_corpus("corpus.jsonl", &docs_for(vectors));
    let mut settings = small_settings(&test.index_dir());
    settings.training.seed = seed;
    let mut pipeline = IndexPipeline::new(settings, factory(precomputed(vectors, &[]))).unwrap();
    pipeline.run(&corpus).unwrap();
}

/// The data file the current metadata points at.
fn data_path(test: &TestIndex) -> PathBuf {
    let layout = IndexLayout::new(test.index_dir());
    let meta = MergedIndexMeta::load(&layout.merged_meta()).unwrap();
    layout.merged_data(&meta)
}

fn assert_corrupt(result: Result<QueryEngine, IndexError>) {
    match result {
        Err(IndexError::IndexCorrupt { path, reason }) => {
            println!("Refused {}: {reason}", path.display());
        }
        Err(other) => panic!("expected IndexCorrupt, got {other:?}"),
        Ok(_) => panic!("expected IndexCorrupt, index loaded"),
    }
}

#[test]
fn test_flipped_data_byte_is_detected() {
    let test = TestIndex::new();
    build(&test, &sphere_points(30), 1);
    let data_path = data_path(&test);

    let mut bytes = fs::read(&data_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&data_path, bytes).unwrap();

    assert_corrupt(QueryEngine::load(&test.index_dir(), 2));
}

#[test]
fn test_truncated_data_is_detected() {
    let test = TestIndex::new();
    build(&test, &sphere_points(30), 1);
    let data_path = data_path(&test);

    let bytes = fs::read(&data_path).unwrap();
    fs::write(&data_path, &bytes[..bytes.len() / 2]).unwrap();

    assert_corrupt(QueryEngine::load(&test.index_dir(), 2));
}

#[test]
fn test_unparsable_metadata_is_detected() {
    let test = TestIndex::new();
    build(&test, &sphere_points(30), 1);
    fs::write(test.index_dir().join("merged.meta.json"), "{ \"version\": 1,").unwrap();

    assert_corrupt(QueryEngine::load(&test.index_dir(), 2));
}

#[test]
fn test_codebook_from_another_training_is_detected() {
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    build(&test, &vectors, 1);
    let meta = fs::read(test.index_dir().join("merged.meta.json")).unwrap();
    let old_data_path = data_path(&test);
    let data = fs::read(&old_data_path).unwrap();

    // A second build retrains the codebook; putting the old merged files
    // back pairs them with a codebook they were not encoded with.
    build(&test, &vectors, 2);
    fs::write(test.index_dir().join("merged.meta.json"), meta).unwrap();
    fs::write(&old_data_path, data).unwrap();

    assert_corrupt(QueryEngine::load(&test.index_dir(), 2));
}

#[test]
fn test_missing_index_is_corrupt() {
    let test = TestIndex::new();
    assert_corrupt(QueryEngine::load(&test.index_dir(), 2));
}

#[tokio::test]
async fn test_watcher_swaps_in_rebuilt_index() {
    println!("\n=== Hot swap: 30 vectors -> 20 vectors ===");
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    build(&test, &vectors, 1);

    let handle = Arc::new(IndexHandle::open(&test.index_dir(), 2).unwrap());
    let service = QueryService::new(
        Arc::clone(&handle),
        EncoderContext::new(DeviceHandle::Cpu, precomputed(&vectors, &[])),
    )
    .with_mapping_from(&test.index_dir().join("id_mapping.json"))
    .unwrap();
    let mut watcher = IndexWatcher::new(Arc::clone(&handle), Duration::from_secs(60));
    assert!(!watcher.check_and_reload().await.unwrap());

    let old = handle.current();
    assert_eq!(old.len(), 30);

    // Coarse mtime resolution on some filesystems.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    build(&test, &vectors[..20], 1);

    assert!(watcher.check_and_reload().await.unwrap());
    let new = handle.current();
    assert_eq!(new.len(), 20);
    println!("✓ Now serving {} vectors", new.len());

    // The id mapping follows the new index.
    let hits = service.search_text("v_5", 1).unwrap();
    assert_eq!(hits[0].id, ExternalId::Text("fn_5".to_string()));

    // Readers holding the old snapshot keep working against it.
    assert_eq!(old.len(), 30);
    let hits = old.search(&vectors[25], 1, None).unwrap();
    assert_eq!(hits[0].id.get(), 25);

    assert!(!watcher.check_and_reload().await.unwrap());
}

#[tokio::test]
async fn test_failed_reload_keeps_serving_current_index() {
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    build(&test, &vectors, 1);

    let handle = Arc::new(IndexHandle::open(&test.index_dir(), 2).unwrap());
    let mut watcher = IndexWatcher::new(Arc::clone(&handle), Duration::from_secs(60));
    let before = handle.current().fingerprint();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    fs::write(test.index_dir().join("merged.meta.json"), "not json").unwrap();

    assert!(matches!(
        watcher.check_and_reload().await,
        Err(IndexError::IndexCorrupt { .. })
    ));
    assert_eq!(handle.current().fingerprint(), before);
    assert_eq!(handle.current().len(), 30);
}
