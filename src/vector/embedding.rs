//! Embedding generation for index building and querying.
//!
//! The embedding model is an external collaborator reached only through
//! [`EmbeddingGenerator`]. Each shard worker owns an [`EncoderContext`]
//! (its device plus its own encoder instance), created through an
//! [`EncoderFactory`] when the worker starts. There is no process-wide model.
//!
//! Every batch coming back from an encoder is checked against the encoding
//! contract: one vector per input, of the expected dimension, finite and
//! unit length within [`UNIT_NORM_TOLERANCE`](crate::vector::UNIT_NORM_TOLERANCE).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fastembed::{
    EmbeddingModel, InitOptions, InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles,
    UserDefinedEmbeddingModel,
};
use sha2::{Digest, Sha256};

use crate::config::ModelConfig;
use crate::error::{IndexError, IndexResult};
use crate::vector::clustering::normalize_vector;
use crate::vector::pool::WorkerConfig;
use crate::vector::types::{PartitionIndex, VectorDimension, VectorError};

/// Trait for generating embeddings from text.
///
/// Implementations of this trait should be thread-safe and
/// capable of handling batch processing efficiently.
pub trait EmbeddingGenerator: Send + Sync {
    /// Generate embeddings for multiple texts.
    ///
    /// # Arguments
    /// * `texts` - Slice of text strings to generate embeddings for
    ///
    /// # Returns
    /// A vector of embeddings, one for each input text, or an error
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError>;

    /// Get the dimension of embeddings produced by this generator.
    #[must_use]
    fn dimension(&self) -> VectorDimension;
}

/// Compute device a worker encodes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceHandle {
    Cpu,
    /// Accelerator ordinal.
    Gpu(u32),
}

impl DeviceHandle {
    /// Round-robins workers over `gpus` accelerators, or CPU when there are none.
    #[must_use]
    pub fn for_worker(worker_index: usize, gpus: usize) -> Self {
        if gpus == 0 {
            Self::Cpu
        } else {
            Self::Gpu((worker_index % gpus) as u32)
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// A worker's private encoder plus the device it runs on.
pub struct EncoderContext {
    device: DeviceHandle,
    encoder: Arc<dyn EmbeddingGenerator>,
}

impl fmt::Debug for EncoderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderContext")
            .field("device", &self.device)
            .field("dimension", &self.encoder.dimension())
            .finish()
    }
}

impl EncoderContext {
    pub fn new(device: DeviceHandle, encoder: Arc<dyn EmbeddingGenerator>) -> Self {
        Self { device, encoder }
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn dimension(&self) -> VectorDimension {
        self.encoder.dimension()
    }

    /// Encodes a batch and enforces the encoding contract.
    ///
    /// Encoder failures map to `ShardEncodingFailure` when a partition is
    /// given and to `Encoder` otherwise. Contract breaches map to
    /// `EncodingContractViolation`.
    pub fn encode_batch(
        &self,
        texts: &[&str],
        partition: Option<PartitionIndex>,
    ) -> IndexResult<Vec<Vec<f32>>> {
        let vectors = self
            .encoder
            .generate_embeddings(texts)
            .map_err(|e| match partition {
                Some(partition) => IndexError::ShardEncodingFailure {
                    partition,
                    reason: e.to_string(),
                },
                None => IndexError::Encoder(e.to_string()),
            })?;
        validate_batch(self.dimension(), texts.len(), &vectors, partition)?;
        Ok(vectors)
    }
}

/// Checks count, dimension, finiteness and unit norm of an encoder batch.
pub fn validate_batch(
    dimension: VectorDimension,
    inputs: usize,
    vectors: &[Vec<f32>],
    partition: Option<PartitionIndex>,
) -> IndexResult<()> {
    if vectors.len() != inputs {
        return Err(IndexError::EncodingContractViolation {
            partition,
            reason: format!("encoder returned {} vectors for {inputs} inputs", vectors.len()),
        });
    }
    for (i, vector) in vectors.iter().enumerate() {
        dimension.validate_unit_vector(vector).map_err(|e| {
            IndexError::EncodingContractViolation {
                partition,
                reason: format!("vector {i} of batch: {e}"),
            }
        })?;
    }
    Ok(())
}

/// Creates the encoder context of one worker.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, worker: &WorkerConfig) -> IndexResult<EncoderContext>;
}

impl<F> EncoderFactory for F
where
    F: Fn(&WorkerConfig) -> IndexResult<EncoderContext> + Send + Sync,
{
    fn create(&self, worker: &WorkerConfig) -> IndexResult<EncoderContext> {
        self(worker)
    }
}

/// Loads a separate fastembed model for every worker.
#[derive(Debug, Clone)]
pub struct FastEmbedFactory {
    config: ModelConfig,
}

impl FastEmbedFactory {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl EncoderFactory for FastEmbedFactory {
    fn create(&self, worker: &WorkerConfig) -> IndexResult<EncoderContext> {
        tracing::debug!(
            "Loading encoder for worker {} on {}",
            worker.worker_index,
            worker.device
        );
        let generator = FastEmbedGenerator::from_config(&self.config, false)
            .map_err(|e| IndexError::Encoder(e.to_string()))?;
        Ok(EncoderContext::new(worker.device, Arc::new(generator)))
    }
}

/// Hands every worker the same thread-safe generator.
#[derive(Clone)]
pub struct SharedEncoderFactory {
    encoder: Arc<dyn EmbeddingGenerator>,
}

impl SharedEncoderFactory {
    pub fn new(encoder: Arc<dyn EmbeddingGenerator>) -> Self {
        Self { encoder }
    }
}

impl EncoderFactory for SharedEncoderFactory {
    fn create(&self, worker: &WorkerConfig) -> IndexResult<EncoderContext> {
        Ok(EncoderContext::new(worker.device, Arc::clone(&self.encoder)))
    }
}

/// Resolves a model name from settings to a fastembed model.
pub fn parse_embedding_model(name: &str) -> Result<EmbeddingModel, VectorError> {
    match name {
        "AllMiniLML6V2" | "all-MiniLM-L6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "AllMiniLML12V2" | "all-MiniLM-L12-v2" => Ok(EmbeddingModel::AllMiniLML12V2),
        "BGESmallENV15" | "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "BGEBaseENV15" | "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        other => Err(VectorError::EmbeddingFailed(format!(
            "unknown embedding model '{other}'. Supported: AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15, BGEBaseENV15"
        ))),
    }
}

/// Default model download cache.
pub fn default_models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codesearch-index")
        .join("models")
}

/// FastEmbed implementation of [`EmbeddingGenerator`].
///
/// Runs either a named fastembed model or a fine-tuned ONNX export. Outputs
/// are L2-normalized before they are returned.
pub struct FastEmbedGenerator {
    model: Mutex<TextEmbedding>,
    dimension: VectorDimension,
}

impl FastEmbedGenerator {
    /// Builds the generator described by `config`.
    ///
    /// With `fine_tuned_model_path` set, `model.onnx` is read from there and
    /// the tokenizer files from `base_model_path`; otherwise `name` selects a
    /// fastembed model, downloaded into the cache on first use.
    ///
    /// # Errors
    /// Returns an error if the model fails to initialize or download.
    pub fn from_config(config: &ModelConfig, show_progress: bool) -> Result<Self, VectorError> {
        let model = match &config.fine_tuned_model_path {
            Some(fine_tuned) => {
                let base = config.base_model_path.as_deref().ok_or_else(|| {
                    VectorError::EmbeddingFailed(
                        "model.base_model_path is required with a fine-tuned model".to_string(),
                    )
                })?;
                Self::load_user_defined(base, fine_tuned)?
            }
            None => {
                let cache_dir = config.cache_dir.clone().unwrap_or_else(default_models_dir);
                TextEmbedding::try_new(
                    InitOptions::new(parse_embedding_model(&config.name)?)
                        .with_cache_dir(cache_dir)
                        .with_show_download_progress(show_progress),
                )
                .map_err(|e| VectorError::EmbeddingFailed(
                    format!("Failed to initialize embedding model: {e}. Ensure you have internet connection for first-time model download")
                ))?
            }
        };
        Self::with_model(model)
    }

    fn load_user_defined(base: &Path, fine_tuned: &Path) -> Result<TextEmbedding, VectorError> {
        let read = |path: PathBuf| {
            std::fs::read(&path).map_err(|e| {
                VectorError::EmbeddingFailed(format!("failed to read '{}': {e}", path.display()))
            })
        };
        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read(base.join("tokenizer.json"))?,
            config_file: read(base.join("config.json"))?,
            special_tokens_map_file: read(base.join("special_tokens_map.json"))?,
            tokenizer_config_file: read(base.join("tokenizer_config.json"))?,
        };
        let onnx = read(fine_tuned.join("model.onnx"))?;

        // The fine-tuned encoder is trained on its pooler (CLS) output
        let model = UserDefinedEmbeddingModel::new(onnx, tokenizer_files).with_pooling(Pooling::Cls);
        TextEmbedding::try_new_from_user_defined(model, InitOptionsUserDefined::default()).map_err(
            |e| VectorError::EmbeddingFailed(format!("Failed to load fine-tuned model: {e}")),
        )
    }

    fn with_model(mut model: TextEmbedding) -> Result<Self, VectorError> {
        // Get dimensions by generating a test embedding
        let probe = model
            .embed(vec!["test"], None)
            .map_err(|e| VectorError::EmbeddingFailed(e.to_string()))?;
        let dimension = probe.first().map(Vec::len).unwrap_or_default();
        Ok(Self {
            model: Mutex::new(model),
            dimension: VectorDimension::new(dimension)?,
        })
    }
}

impl EmbeddingGenerator for FastEmbedGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut embeddings = self
            .model
            .lock()
            .map_err(|_| {
                VectorError::EmbeddingFailed(
                    "Failed to acquire embedding model lock - model may be poisoned".to_string(),
                )
            })?
            .embed(texts.to_vec(), None)
            .map_err(|e| {
                VectorError::EmbeddingFailed(format!("Failed to generate embeddings: {e}"))
            })?;

        for embedding in embeddings.iter_mut() {
            self.dimension.validate_vector(embedding)?;
            normalize_vector(embedding);
        }

        Ok(embeddings)
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}

/// Deterministic, model-free generator for tests and benchmarks.
///
/// Each text hashes (SHA-256) to a fixed pseudo-random unit vector.
#[derive(Debug, Clone)]
pub struct MockEmbeddingGenerator {
    dimension: VectorDimension,
}

impl Default for MockEmbeddingGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbeddingGenerator {
    /// Create a new mock generator with standard 384 dimensions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dimension: VectorDimension::dimension_384(),
        }
    }

    /// Create a generator with custom dimension for testing.
    #[must_use]
    pub fn with_dimension(dimension: VectorDimension) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let dim = self.dimension.get();
        let mut embedding = Vec::with_capacity(dim);
        let mut block = 0u32;
        while embedding.len() < dim {
            let mut hasher = Sha256::new();
            hasher.update(block.to_le_bytes());
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(2) {
                if embedding.len() == dim {
                    break;
                }
                let raw = u16::from_le_bytes([chunk[0], chunk[1]]);
                embedding.push(f32::from(raw) / f32::from(u16::MAX) - 0.5);
            }
            block += 1;
        }
        normalize_vector(&mut embedding);
        embedding
    }
}

impl EmbeddingGenerator for MockEmbeddingGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}

/// Serves embeddings that were computed ahead of time, keyed by text.
///
/// Texts without an entry fail the batch.
#[derive(Debug, Clone)]
pub struct PrecomputedEmbeddings {
    dimension: VectorDimension,
    vectors: HashMap<String, Vec<f32>>,
}

impl PrecomputedEmbeddings {
    pub fn new(dimension: VectorDimension) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
        }
    }

    pub fn insert(&mut self, text: impl Into<String>, vector: Vec<f32>) {
        self.vectors.insert(text.into(), vector);
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl EmbeddingGenerator for PrecomputedEmbeddings {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        texts
            .iter()
            .map(|text| {
                self.vectors.get(*text).cloned().ok_or_else(|| {
                    VectorError::EmbeddingFailed(format!("no precomputed embedding for '{text}'"))
                })
            })
            .collect()
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}
