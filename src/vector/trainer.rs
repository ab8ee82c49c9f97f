//! Codebook training: IVF coarse quantizer plus residual product quantizer.
//!
//! Training runs once, on a bounded sample drawn from the start of the
//! corpus stream. The result is frozen; every shard builder encodes with the
//! same codebook.

use std::path::Path;

use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::error::{IndexError, IndexResult};
use crate::vector::clustering::{KMeansConfig, Metric, argmax_inner_product, kmeans};
use crate::vector::codebook::{Codebook, TrainingParams};
use crate::vector::quantizer::ProductQuantizer;
use crate::vector::types::VectorDimension;

/// Trains codebooks from a sample of unit vectors.
#[derive(Debug, Clone)]
pub struct IndexTrainer {
    config: TrainingConfig,
}

impl IndexTrainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Trains a codebook.
    ///
    /// # Errors
    /// - `TrainingDataInsufficient` when the sample is empty, smaller than
    ///   `cells * min_points_per_cell`, or has fewer distinct directions than cells
    /// - `EncodingContractViolation` when a sample vector has the wrong
    ///   dimension or is not unit length
    /// - `InvalidConfig` when the dimension cannot be split into the
    ///   configured subspaces
    pub fn train(&self, sample: &[Vec<f32>]) -> IndexResult<Codebook> {
        let cells = self.config.cells;
        let required = self.config.required_samples().max(1);
        if sample.len() < required {
            return Err(IndexError::TrainingDataInsufficient {
                samples: sample.len(),
                required,
                cells,
            });
        }

        let dimension = sample[0].len();
        ProductQuantizer::validate_params(
            dimension,
            self.config.subspaces,
            self.config.bits_per_subspace,
        )
        .map_err(|reason| IndexError::InvalidConfig { reason })?;

        let expected = VectorDimension::new(dimension).map_err(|e| {
            IndexError::EncodingContractViolation {
                partition: None,
                reason: e.to_string(),
            }
        })?;
        for (i, vector) in sample.iter().enumerate() {
            expected.validate_unit_vector(vector).map_err(|e| {
                IndexError::EncodingContractViolation {
                    partition: None,
                    reason: format!("training vector {i}: {e}"),
                }
            })?;
        }

        info!(
            "Training coarse quantizer: {} vectors, dimension {dimension}, {cells} cells",
            sample.len()
        );
        let coarse_config = KMeansConfig::new(cells, Metric::InnerProduct, self.config.seed)
            .with_max_iterations(self.config.max_iterations);
        let coarse = kmeans(sample, &coarse_config)?;
        if coarse.centroids.len() < cells {
            return Err(IndexError::TrainingDataInsufficient {
                samples: sample.len(),
                required,
                cells,
            });
        }
        debug!("Coarse quantizer converged after {} iterations", coarse.iterations);

        // Residuals against the cell each vector will be encoded into
        let residuals: Vec<Vec<f32>> = sample
            .iter()
            .map(|v| {
                let (cell, _) = argmax_inner_product(v, &coarse.centroids);
                v.iter()
                    .zip(coarse.centroids[cell].iter())
                    .map(|(x, c)| x - c)
                    .collect()
            })
            .collect();

        info!(
            "Training product quantizer: {} subspaces x {} bits",
            self.config.subspaces, self.config.bits_per_subspace
        );
        let pq = ProductQuantizer::train(
            &residuals,
            self.config.subspaces,
            self.config.bits_per_subspace,
            self.config.seed,
            self.config.max_iterations,
        )?;

        let params = TrainingParams {
            cells: cells as u32,
            subspaces: self.config.subspaces as u32,
            bits_per_subspace: self.config.bits_per_subspace,
            seed: self.config.seed,
            training_samples: sample.len() as u64,
        };
        let codebook = Codebook::from_parts(coarse.centroids, pq, params)?;
        info!("Trained codebook {}", codebook.fingerprint());
        Ok(codebook)
    }

    /// Trains and persists the codebook to `path`.
    pub fn train_and_save(&self, sample: &[Vec<f32>], path: &Path) -> IndexResult<Codebook> {
        let codebook = self.train(sample)?;
        codebook.save(path)?;
        Ok(codebook)
    }
}
