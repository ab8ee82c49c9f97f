#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codesearch_index::Settings;
use codesearch_index::vector::{
    CorpusReader, EmbeddingGenerator, EncoderFactory, MockEmbeddingGenerator,
    PrecomputedEmbeddings, SharedEncoderFactory, VectorDimension, normalize_vector,
};
use tempfile::TempDir;

/// A corpus file plus an index directory in one temp dir.
pub struct TestIndex {
    pub dir: TempDir,
}

impl TestIndex {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn index_dir(&self) -> PathBuf {
        self.dir.path().join("index")
    }

    /// Writes `docs` as JSONL with `id` and `code` fields.
    pub fn write_corpus(&self, name: &str, docs: &[(String, String)]) -> CorpusReader {
        let path = self.dir.path().join(name);
        let lines: Vec<String> = docs
            .iter()
            .map(|(id, code)| serde_json::json!({ "id": id, "code": code }).to_string())
            .collect();
        fs::write(&path, lines.join("\n")).expect("Failed to write corpus");
        CorpusReader::new(path, "code", "id")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// `n` well-spread unit vectors in 3D (Fibonacci sphere).
pub fn sphere_points(n: usize) -> Vec<Vec<f32>> {
    let golden_angle = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let radius = (1.0 - z * z).sqrt();
            let theta = golden_angle * i as f64;
            let mut v = vec![
                (radius * theta.cos()) as f32,
                (radius * theta.sin()) as f32,
                z as f32,
            ];
            normalize_vector(&mut v);
            v
        })
        .collect()
}

/// `v` nudged towards `towards` and renormalized.
pub fn perturbed(v: &[f32], towards: &[f32], amount: f32) -> Vec<f32> {
    let mut out: Vec<f32> = v
        .iter()
        .zip(towards)
        .map(|(a, b)| a + amount * b)
        .collect();
    normalize_vector(&mut out);
    out
}

/// Documents `("fn_i", "v_i")` for every vector.
pub fn docs_for(vectors: &[Vec<f32>]) -> Vec<(String, String)> {
    (0..vectors.len())
        .map(|i| (format!("fn_{i}"), format!("v_{i}")))
        .collect()
}

/// Encoder mapping the text `v_i` to `vectors[i]`, plus any extra entries.
pub fn precomputed(
    vectors: &[Vec<f32>],
    extra: &[(&str, Vec<f32>)],
) -> Arc<PrecomputedEmbeddings> {
    let dim = VectorDimension::new(vectors[0].len()).expect("valid dimension");
    let mut table = PrecomputedEmbeddings::new(dim);
    for (i, v) in vectors.iter().enumerate() {
        table.insert(format!("v_{i}"), v.clone());
    }
    for (text, v) in extra {
        table.insert(*text, v.clone());
    }
    Arc::new(table)
}

pub fn factory(encoder: Arc<dyn EmbeddingGenerator>) -> Arc<dyn EncoderFactory> {
    Arc::new(SharedEncoderFactory::new(encoder))
}

pub fn mock_encoder(dim: usize) -> Arc<dyn EmbeddingGenerator> {
    Arc::new(MockEmbeddingGenerator::with_dimension(
        VectorDimension::new(dim).expect("valid dimension"),
    ))
}

/// Settings for the small 3D scenario: 2 cells, partitions of 10, one PQ
/// subspace per coordinate, training on the whole corpus.
pub fn small_settings(output_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.output_dir = output_dir.to_path_buf();
    settings.build.workers = 3;
    settings.build.partition_size = 10;
    settings.build.sub_batch_size = 4;
    settings.build.train_sample_size = Some(30);
    settings.training.cells = 2;
    settings.training.subspaces = 3;
    settings.training.bits_per_subspace = 8;
    settings.search.nprobe = 2;
    settings
}
