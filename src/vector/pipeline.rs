//! Index build orchestration.
//!
//! A build moves through [`BuildState`]s in one direction only:
//!
//! ```text
//! Untrained -> Trained -> ShardsBuilding -> ShardsComplete -> Merged -> Servable
//! ```
//!
//! [`IndexPipeline`] drives the steps against one index directory and
//! refuses any step out of order.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::config::Settings;
use crate::error::{ErrorContext, IndexError, IndexResult};
use crate::vector::codebook::{Codebook, Fingerprint};
use crate::vector::corpus::{CorpusReader, IdMapping, partitions};
use crate::vector::embedding::{DeviceHandle, EncoderFactory};
use crate::vector::engine::QueryEngine;
use crate::vector::layout::IndexLayout;
use crate::vector::merge::{MergedIndexMeta, SegmentMerger};
use crate::vector::pool::{PartitionOutcome, WorkerConfig, WorkerPool};
use crate::vector::segment::SegmentSummary;
use crate::vector::shard::ShardBuilder;
use crate::vector::trainer::IndexTrainer;

/// Stage of an index build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum BuildState {
    Untrained,
    Trained,
    ShardsBuilding,
    ShardsComplete,
    Merged,
    Servable,
}

impl BuildState {
    /// The only state this one may move to.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Untrained => Some(Self::Trained),
            Self::Trained => Some(Self::ShardsBuilding),
            Self::ShardsBuilding => Some(Self::ShardsComplete),
            Self::ShardsComplete => Some(Self::Merged),
            Self::Merged => Some(Self::Servable),
            Self::Servable => None,
        }
    }

    /// Furthest state the artifacts in `layout` show, without validating them.
    pub fn detect(layout: &IndexLayout) -> Self {
        let merged = MergedIndexMeta::load(&layout.merged_meta())
            .is_ok_and(|meta| layout.merged_data(&meta).exists());
        if merged {
            Self::Merged
        } else if !layout.codebook().exists() {
            Self::Untrained
        } else if layout
            .existing_segments()
            .is_ok_and(|segments| !segments.is_empty())
        {
            Self::ShardsBuilding
        } else {
            Self::Trained
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Untrained => "untrained",
            Self::Trained => "trained",
            Self::ShardsBuilding => "shards-building",
            Self::ShardsComplete => "shards-complete",
            Self::Merged => "merged",
            Self::Servable => "servable",
        };
        f.write_str(name)
    }
}

/// Enforces the one-directional build order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildLifecycle {
    state: BuildState,
}

impl Default for BuildLifecycle {
    fn default() -> Self {
        Self::at(BuildState::Untrained)
    }
}

impl BuildLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues a build whose earlier steps ran elsewhere.
    pub fn at(state: BuildState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Moves to `to`, which must directly follow the current state.
    pub fn advance(&mut self, to: BuildState) -> IndexResult<()> {
        if self.state.next() != Some(to) {
            return Err(IndexError::InvalidStateTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!("Build state {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }
}

/// Summary of a complete build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub codebook: Fingerprint,
    pub segments: Vec<SegmentSummary>,
    pub meta: MergedIndexMeta,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn reused_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.reused).count()
    }
}

type OutcomeCallback = Box<dyn Fn(&PartitionOutcome) + Send + Sync>;

/// Runs the build steps for one index directory.
pub struct IndexPipeline {
    settings: Settings,
    layout: IndexLayout,
    factory: Arc<dyn EncoderFactory>,
    lifecycle: BuildLifecycle,
    on_outcome: Option<OutcomeCallback>,
}

impl IndexPipeline {
    pub fn new(settings: Settings, factory: Arc<dyn EncoderFactory>) -> IndexResult<Self> {
        settings.validate()?;
        let layout = IndexLayout::new(&settings.output_dir);
        Ok(Self {
            settings,
            layout,
            factory,
            lifecycle: BuildLifecycle::new(),
            on_outcome: None,
        })
    }

    /// Starts from `state` instead of `Untrained`.
    #[must_use]
    pub fn resume_at(mut self, state: BuildState) -> Self {
        self.lifecycle = BuildLifecycle::at(state);
        self
    }

    /// Called on the calling thread as each partition finishes.
    #[must_use]
    pub fn with_progress(
        mut self,
        on_outcome: impl Fn(&PartitionOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.on_outcome = Some(Box::new(on_outcome));
        self
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> BuildState {
        self.lifecycle.state()
    }

    fn worker_config(&self, worker_index: usize) -> WorkerConfig {
        WorkerConfig {
            worker_index,
            device: DeviceHandle::for_worker(worker_index, self.settings.build.gpus),
        }
    }

    /// Writes `id_mapping.json` for `corpus`.
    pub fn write_id_mapping(&self, corpus: &CorpusReader) -> IndexResult<IdMapping> {
        let mapping = IdMapping::build_from_corpus(corpus)?;
        mapping.save(&self.layout.id_mapping())?;
        Ok(mapping)
    }

    /// Encodes the head of `texts` and trains the codebook on it.
    ///
    /// With `build.resume`, an existing codebook trained with the same
    /// parameters on a sample of the same size is kept instead.
    pub fn train<I>(&mut self, texts: I) -> IndexResult<Arc<Codebook>>
    where
        I: IntoIterator<Item = IndexResult<String>>,
    {
        let head = texts
            .into_iter()
            .take(self.settings.build.effective_train_sample_size())
            .collect::<IndexResult<Vec<String>>>()?;

        if self.settings.build.resume {
            if let Some(codebook) = self.reusable_codebook(head.len()) {
                info!("Reusing codebook {}", codebook.fingerprint());
                self.lifecycle.advance(BuildState::Trained)?;
                return Ok(codebook);
            }
        }

        let ctx = self.factory.create(&self.worker_config(0))?;
        self.settings.validate_for_dimension(ctx.dimension().get())?;

        let mut sample = Vec::with_capacity(head.len());
        for batch in head.chunks(self.settings.build.sub_batch_size) {
            let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
            sample.extend(ctx.encode_batch(&refs, None)?);
        }
        info!(
            "Training on {} vectors encoded on {}",
            sample.len(),
            ctx.device()
        );

        let trainer = IndexTrainer::new(self.settings.training.clone());
        let codebook = trainer.train_and_save(&sample, &self.layout.codebook())?;
        self.lifecycle.advance(BuildState::Trained)?;
        Ok(Arc::new(codebook))
    }

    /// Loads the codebook of this directory.
    pub fn load_codebook(&self) -> IndexResult<Arc<Codebook>> {
        Ok(Arc::new(Codebook::load(&self.layout.codebook())?))
    }

    fn reusable_codebook(&self, samples: usize) -> Option<Arc<Codebook>> {
        let path = self.layout.codebook();
        if !path.exists() {
            return None;
        }
        let codebook = Codebook::load(&path).ok()?;
        let params = codebook.params();
        let training = &self.settings.training;
        let matches = params.cells as usize == training.cells
            && params.subspaces as usize == training.subspaces
            && params.bits_per_subspace == training.bits_per_subspace
            && params.seed == training.seed
            && params.training_samples == samples as u64;
        matches.then(|| Arc::new(codebook))
    }

    /// Partitions `texts` and builds every segment on the worker pool.
    ///
    /// Returns once all workers are done. Fails with `PartitionsFailed` if
    /// any partition failed; segments of the others stay on disk.
    pub fn build_shards<I>(
        &mut self,
        codebook: Arc<Codebook>,
        texts: I,
    ) -> IndexResult<Vec<SegmentSummary>>
    where
        I: IntoIterator<Item = IndexResult<String>>,
        I::IntoIter: Send,
    {
        self.lifecycle.advance(BuildState::ShardsBuilding)?;
        std::fs::create_dir_all(self.layout.root()).write_context(self.layout.root())?;

        let build = &self.settings.build;
        let pool = WorkerPool::new(build.workers)
            .with_gpus(build.gpus)
            .with_resume(build.resume);
        let builder = ShardBuilder::new(build.sub_batch_size);
        let on_outcome = |outcome: &PartitionOutcome| {
            if let Some(callback) = &self.on_outcome {
                callback(outcome);
            }
        };

        let report = pool.run(
            partitions(texts, build.partition_size),
            codebook,
            self.layout.root(),
            &builder,
            self.factory.as_ref(),
            &on_outcome,
        )?;
        let segments = report.into_result()?;

        self.lifecycle.advance(BuildState::ShardsComplete)?;
        Ok(segments)
    }

    /// Merges segments `0..partitions` into the served index files.
    pub fn merge(
        &mut self,
        codebook: Arc<Codebook>,
        partitions: usize,
    ) -> IndexResult<MergedIndexMeta> {
        if self.state() != BuildState::ShardsComplete {
            return Err(IndexError::InvalidStateTransition {
                from: self.state(),
                to: BuildState::Merged,
            });
        }
        let meta = SegmentMerger::new(self.layout.root(), codebook).merge(partitions)?;
        self.lifecycle.advance(BuildState::Merged)?;
        Ok(meta)
    }

    /// Number of partitions the segments on disk belong to: one past the
    /// highest segment index found.
    pub fn partitions_on_disk(&self) -> IndexResult<usize> {
        let segments = self
            .layout
            .existing_segments()
            .read_context(self.layout.root())?;
        Ok(segments.last().map_or(0, |p| p.get() as usize + 1))
    }

    /// Loads the merged index for serving.
    pub fn open_engine(&mut self) -> IndexResult<QueryEngine> {
        if self.state() != BuildState::Merged {
            return Err(IndexError::InvalidStateTransition {
                from: self.state(),
                to: BuildState::Servable,
            });
        }
        let engine = QueryEngine::load(self.layout.root(), self.settings.search.nprobe)?;
        self.lifecycle.advance(BuildState::Servable)?;
        Ok(engine)
    }

    /// Id mapping, training, shards and merge over `corpus`.
    pub fn run(&mut self, corpus: &CorpusReader) -> IndexResult<BuildReport> {
        let started = Instant::now();
        info!(
            "Building index from {} into {}",
            corpus.path().display(),
            self.layout.root().display()
        );

        let mapping = self.write_id_mapping(corpus)?;
        let codebook = self.train(corpus.texts()?)?;
        let segments = self.build_shards(Arc::clone(&codebook), corpus.texts()?)?;
        let meta = self.merge(Arc::clone(&codebook), segments.len())?;

        if mapping.len() as u64 != meta.vector_count {
            return Err(IndexError::IdMappingMismatch {
                mapping: mapping.len(),
                indexed: meta.vector_count,
            });
        }

        let report = BuildReport {
            codebook: codebook.fingerprint(),
            segments,
            meta,
            elapsed: started.elapsed(),
        };
        info!(
            "Indexed {} vectors in {} segments ({} reused) in {:.1}s",
            report.meta.vector_count,
            report.segments.len(),
            report.reused_segments(),
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }
}
