//! Configuration module for the index builder and query engine.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `CSI_` and use double underscores
//! to separate nested levels:
//! - `CSI_BUILD__WORKERS=8` sets `build.workers`
//! - `CSI_TRAINING__CELLS=4096` sets `training.cells`
//! - `CSI_SEARCH__NPROBE=32` sets `search.nprobe`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IndexError, IndexResult};
use crate::vector::{MAX_BITS_PER_SUBSPACE, ProductQuantizer};

/// Directory holding the settings file, relative to the workspace root.
pub const CONFIG_DIR: &str = ".codesearch";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory receiving the codebook, segments and merged index
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Global debug mode
    #[serde(default = "default_false")]
    pub debug: bool,

    /// Embedding model settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Corpus input settings
    #[serde(default)]
    pub corpus: CorpusConfig,

    /// Shard building settings
    #[serde(default)]
    pub build: BuildConfig,

    /// Codebook training settings
    #[serde(default)]
    pub training: TrainingConfig,

    /// Query settings
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    /// fastembed model used when no fine-tuned model is configured
    #[serde(default = "default_embedding_model")]
    pub name: String,

    /// Directory with the tokenizer files of the base model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model_path: Option<PathBuf>,

    /// Directory with the fine-tuned `model.onnx`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fine_tuned_model_path: Option<PathBuf>,

    /// Model download cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorpusConfig {
    /// JSONL corpus file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Field holding the text to encode
    #[serde(default = "default_text_field")]
    pub text_field: String,

    /// Field holding the external document id
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BuildConfig {
    /// Number of shard builder workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Documents per partition (one segment each)
    #[serde(default = "default_partition_size")]
    pub partition_size: usize,

    /// Documents handed to the encoder at once
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,

    /// Training sample size; defaults to `partition_size`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_sample_size: Option<usize>,

    /// Skip partitions whose segment is already complete
    #[serde(default = "default_false")]
    pub resume: bool,

    /// Accelerators to spread workers over; 0 keeps every worker on the CPU
    #[serde(default)]
    pub gpus: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrainingConfig {
    /// Number of coarse cells (nlist)
    #[serde(default = "default_cells")]
    pub cells: usize,

    /// Number of PQ subspaces (M); must divide the vector dimension
    #[serde(default = "default_subspaces")]
    pub subspaces: usize,

    /// Bits per PQ code, 1..=8
    #[serde(default = "default_bits_per_subspace")]
    pub bits_per_subspace: u8,

    /// Seed for k-means initialization
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Minimum training vectors required per coarse cell
    #[serde(default = "default_min_points_per_cell")]
    pub min_points_per_cell: usize,

    /// Maximum Lloyd iterations per k-means run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchConfig {
    /// Default number of cells scanned per query
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,

    /// Default number of results
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Seconds between checks for a newly published index
    #[serde(default = "default_watch_interval")]
    pub watch_interval: u64,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".codesearch/index")
}
fn default_false() -> bool {
    false
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}
fn default_text_field() -> String {
    "code".to_string()
}
fn default_id_field() -> String {
    "id".to_string()
}
fn default_workers() -> usize {
    num_cpus::get()
}
fn default_partition_size() -> usize {
    1 << 20
}
fn default_sub_batch_size() -> usize {
    1 << 10
}
fn default_cells() -> usize {
    8192
}
fn default_subspaces() -> usize {
    8
}
fn default_bits_per_subspace() -> u8 {
    8
}
fn default_seed() -> u64 {
    0x5EED
}
fn default_min_points_per_cell() -> usize {
    4
}
fn default_max_iterations() -> usize {
    crate::vector::DEFAULT_MAX_ITERATIONS
}
fn default_nprobe() -> usize {
    64
}
fn default_k() -> usize {
    10
}
fn default_watch_interval() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            output_dir: default_output_dir(),
            debug: false,
            model: ModelConfig::default(),
            corpus: CorpusConfig::default(),
            build: BuildConfig::default(),
            training: TrainingConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_embedding_model(),
            base_model_path: None,
            fine_tuned_model_path: None,
            cache_dir: None,
        }
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: None,
            text_field: default_text_field(),
            id_field: default_id_field(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            partition_size: default_partition_size(),
            sub_batch_size: default_sub_batch_size(),
            train_sample_size: None,
            resume: false,
            gpus: 0,
        }
    }
}

impl BuildConfig {
    /// Training sample size actually used.
    #[must_use]
    pub fn effective_train_sample_size(&self) -> usize {
        self.train_sample_size.unwrap_or(self.partition_size)
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            cells: default_cells(),
            subspaces: default_subspaces(),
            bits_per_subspace: default_bits_per_subspace(),
            seed: default_seed(),
            min_points_per_cell: default_min_points_per_cell(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl TrainingConfig {
    /// Smallest training sample that can train `cells` cells.
    #[must_use]
    pub fn required_samples(&self) -> usize {
        self.cells.saturating_mul(self.min_points_per_cell)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            nprobe: default_nprobe(),
            default_k: default_k(),
            watch_interval: default_watch_interval(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        // Try to find the workspace root by looking for .codesearch directory
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring `CSI_` variables
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path.as_ref()))
            // Layer in environment variables with CSI_ prefix
            // Use double underscore (__) to separate nested levels
            // Single underscore (_) remains as is within field names
            .merge(Env::prefixed("CSI_").map(|key| {
                key.as_str()
                    .to_lowercase()
                    .replace("__", ".") // Double underscore becomes dot
                    .into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the workspace config by looking for .codesearch directory
    /// Searches from current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    /// Rejects settings no build or query could run with.
    pub fn validate(&self) -> IndexResult<()> {
        let invalid = |reason: String| Err(IndexError::InvalidConfig { reason });

        if self.build.workers == 0 {
            return invalid("build.workers must be at least 1".to_string());
        }
        if self.build.partition_size == 0 || self.build.sub_batch_size == 0 {
            return invalid(
                "build.partition_size and build.sub_batch_size must be at least 1".to_string(),
            );
        }
        if self.training.cells == 0 || self.training.min_points_per_cell == 0 {
            return invalid(
                "training.cells and training.min_points_per_cell must be at least 1".to_string(),
            );
        }
        if self.training.subspaces == 0 {
            return invalid("training.subspaces must be at least 1".to_string());
        }
        if self.training.bits_per_subspace == 0
            || self.training.bits_per_subspace > MAX_BITS_PER_SUBSPACE
        {
            return invalid(format!(
                "training.bits_per_subspace must be in 1..={MAX_BITS_PER_SUBSPACE}"
            ));
        }
        let sample = self.build.effective_train_sample_size();
        if sample < self.training.required_samples() {
            return invalid(format!(
                "training sample of {sample} vectors cannot train {} cells with {} points each",
                self.training.cells, self.training.min_points_per_cell
            ));
        }
        if self.search.nprobe == 0 || self.search.default_k == 0 {
            return invalid("search.nprobe and search.default_k must be at least 1".to_string());
        }
        Ok(())
    }

    /// Checks the settings against the encoder's output dimension.
    pub fn validate_for_dimension(&self, dimension: usize) -> IndexResult<()> {
        self.validate()?;
        ProductQuantizer::validate_params(
            dimension,
            self.training.subspaces,
            self.training.bits_per_subspace,
        )
        .map_err(|reason| IndexError::InvalidConfig { reason })
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join("settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        // Create parent directory if needed
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# codesearch-index configuration

# Version of the configuration schema
version = 1

# Directory receiving trained.index, segment_*.seg and the merged index
output_dir = ".codesearch/index"

# Global debug mode
debug = false

[model]
# fastembed model: AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15, BGEBaseENV15
name = "AllMiniLML6V2"

# Use a fine-tuned ONNX model instead of the named one.
# Tokenizer files are read from base_model_path, model.onnx from fine_tuned_model_path.
# base_model_path = "models/base"
# fine_tuned_model_path = "models/fine-tuned"

[corpus]
# JSONL file, one document per line
# path = "data/corpus.jsonl"
text_field = "code"
id_field = "id"

[build]
# Number of shard builder workers (defaults to CPU count)
# workers = {}

# Documents per partition; each partition becomes one segment
partition_size = 1048576

# Documents encoded per encoder call
sub_batch_size = 1024

# Training sample size (defaults to partition_size)
# train_sample_size = 1048576

# Skip partitions whose segment already exists and matches the codebook
resume = false

# Accelerators to spread workers over (worker i uses device i % gpus)
gpus = 0

[training]
# Coarse cells (nlist)
cells = 8192

# PQ subspaces; must divide the embedding dimension
subspaces = 8

# Bits per PQ code (1-8)
bits_per_subspace = 8

# k-means seed; identical input and seed give an identical codebook
seed = 24301

# Training fails unless the sample has cells * min_points_per_cell vectors
min_points_per_cell = 4

max_iterations = 25

[search]
# Cells scanned per query
nprobe = 64

default_k = 10

# Seconds between checks for a newly merged index
watch_interval = 5
"#,
            num_cpus::get()
        );

        std::fs::write(&config_path, template)?;

        if force {
            println!("Overwrote configuration at: {}", config_path.display());
        } else {
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
        }

        Ok(config_path)
    }
}
