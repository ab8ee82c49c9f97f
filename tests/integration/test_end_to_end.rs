//! Test: full build of a small 3D corpus, then queries against it
//!
//! 30 unit vectors, 3 partitions of 10, 2 coarse cells. Every stored vector
//! must find itself first when all cells are probed, and a query close to
//! v_7 must see id 7 among its top 3.

use crate::common::{
    TestIndex, docs_for, factory, perturbed, precomputed, small_settings, sphere_points,
};
use codesearch_index::vector::{
    BuildState, DeviceHandle, DocumentId, EncoderContext, ExternalId, IdMapping, IndexHandle,
    QueryEngine, QueryService,
};
use codesearch_index::{IndexError, IndexPipeline};
use std::sync::Arc;

#[test]
fn test_end_to_end_self_recall_and_held_out_query() {
    println!("\n=== End-to-end: 30 vectors, 3 partitions, 2 cells ===");
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    let held_out = perturbed(&vectors[7], &vectors[8], 0.05);
    let encoder = precomputed(&vectors, &[("held_out", held_out.clone())]);
    let corpus = test.write_corpus("corpus.jsonl", &docs_for(&vectors));

    let settings = small_settings(&test.index_dir());
    let mut pipeline = IndexPipeline::new(settings, factory(encoder)).unwrap();
    let report = pipeline.run(&corpus).unwrap();
    println!(
        "Built {} vectors in {} segments",
        report.meta.vector_count,
        report.segments.len()
    );

    assert_eq!(report.meta.vector_count, 30);
    assert_eq!(report.segments.len(), 3);
    assert_eq!(report.meta.nlist, 2);
    assert_eq!(pipeline.state(), BuildState::Merged);

    let engine = pipeline.open_engine().unwrap();
    assert_eq!(pipeline.state(), BuildState::Servable);
    assert_eq!(engine.len(), 30);
    assert_eq!(engine.dimension(), 3);

    for (i, v) in vectors.iter().enumerate() {
        let hits = engine.search(v, 1, Some(2)).unwrap();
        assert_eq!(
            hits[0].id,
            DocumentId::new(i as u64),
            "vector {i} should rank first for itself"
        );
    }
    println!("✓ All 30 vectors rank first for themselves");

    let hits = engine.search(&held_out, 3, Some(2)).unwrap();
    println!("Held-out query hits: {hits:?}");
    assert!(hits.iter().any(|h| h.id == DocumentId::new(7)));
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    println!("✓ Held-out query finds v_7 in its top 3");
}

#[test]
fn test_every_id_appears_exactly_once_in_merged_index() {
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    let corpus = test.write_corpus("corpus.jsonl", &docs_for(&vectors));

    let mut pipeline =
        IndexPipeline::new(small_settings(&test.index_dir()), factory(precomputed(&vectors, &[])))
            .unwrap();
    pipeline.run(&corpus).unwrap();
    let engine = QueryEngine::load(&test.index_dir(), 2).unwrap();

    // With all cells probed and k = n, every stored id comes back once.
    let hits = engine.search(&vectors[0], 30, None).unwrap();
    let mut ids: Vec<u64> = hits.iter().map(|h| h.id.get()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..30).collect::<Vec<_>>());

    let partitions: Vec<_> = engine
        .meta()
        .partitions
        .iter()
        .map(|p| (p.ids.start.get(), p.ids.len))
        .collect();
    assert_eq!(partitions, vec![(0, 10), (10, 10), (20, 10)]);
}

#[test]
fn test_query_results_resolve_to_corpus_ids() {
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    let encoder = precomputed(&vectors, &[]);
    let corpus = test.write_corpus("corpus.jsonl", &docs_for(&vectors));

    let mut pipeline =
        IndexPipeline::new(small_settings(&test.index_dir()), factory(encoder.clone())).unwrap();
    pipeline.run(&corpus).unwrap();

    let mapping = IdMapping::load(&pipeline.layout().id_mapping()).unwrap();
    let engine = QueryEngine::load(&test.index_dir(), 2).unwrap();
    let hits = engine
        .search_external(&vectors[12], 1, None, &mapping)
        .unwrap();
    assert_eq!(hits[0].id, ExternalId::Text("fn_12".to_string()));

    let handle = Arc::new(IndexHandle::new(engine));
    let service = QueryService::new(handle, EncoderContext::new(DeviceHandle::Cpu, encoder))
        .with_mapping(mapping);
    let hits = service.search_text("v_21", 1).unwrap();
    assert_eq!(hits[0].id, ExternalId::Text("fn_21".to_string()));
}

#[test]
fn test_query_with_wrong_dimension_is_rejected() {
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    let corpus = test.write_corpus("corpus.jsonl", &docs_for(&vectors));

    let mut pipeline =
        IndexPipeline::new(small_settings(&test.index_dir()), factory(precomputed(&vectors, &[])))
            .unwrap();
    pipeline.run(&corpus).unwrap();
    let engine = QueryEngine::load(&test.index_dir(), 2).unwrap();

    let result = engine.search(&[1.0, 0.0], 3, None);
    assert!(matches!(
        result,
        Err(IndexError::QueryDimensionMismatch {
            expected: 3,
            actual: 2
        })
    ));
}

#[test]
fn test_empty_corpus_fails_training() {
    let test = TestIndex::new();
    let vectors = sphere_points(30);
    let corpus = test.write_corpus("empty.jsonl", &[]);

    let mut pipeline =
        IndexPipeline::new(small_settings(&test.index_dir()), factory(precomputed(&vectors, &[])))
            .unwrap();
    let result = pipeline.run(&corpus);

    assert!(
        matches!(
            result,
            Err(IndexError::TrainingDataInsufficient { samples: 0, .. })
        ),
        "got {result:?}"
    );
    assert_eq!(pipeline.state(), BuildState::Untrained);
    assert!(!pipeline.layout().codebook().exists());
    assert!(!pipeline.layout().merged_meta().exists());
}
