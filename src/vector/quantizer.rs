//! Product quantization of coarse-cell residuals.
//!
//! A D-dimensional residual is split into `M` contiguous sub-vectors of
//! `D / M` components. Each sub-vector is replaced by the index of its nearest
//! codeword in that subspace's codebook, so a vector compresses to `M` bytes.
//!
//! Queries use asymmetric distance computation: the query stays in full
//! precision and a per-query table of `<query_sub, codeword>` products turns
//! scoring a code into `M` table lookups.

use crate::vector::clustering::{KMeansConfig, Metric, kmeans, nearest_centroid};
use crate::vector::clustering::ClusteringError;

/// Upper bound on bits per sub-quantizer (codes are stored as `u8`).
pub const MAX_BITS_PER_SUBSPACE: u8 = 8;

/// Trained product quantizer.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct ProductQuantizer {
    dimension: usize,
    subspaces: usize,
    subspace_dim: usize,
    bits: u8,
    /// [subspace][codeword][subspace_dim]. A subspace may hold fewer than
    /// `2^bits` codewords when the training sample was small.
    codebooks: Vec<Vec<Vec<f32>>>,
}

impl ProductQuantizer {
    /// Checks that a (dimension, subspaces, bits) triple is usable.
    pub fn validate_params(dimension: usize, subspaces: usize, bits: u8) -> Result<(), String> {
        if dimension == 0 || subspaces == 0 {
            return Err("dimension and subspace count must be greater than 0".to_string());
        }
        if dimension % subspaces != 0 {
            return Err(format!(
                "dimension {dimension} is not divisible by {subspaces} subspaces"
            ));
        }
        if bits == 0 || bits > MAX_BITS_PER_SUBSPACE {
            return Err(format!(
                "bits per subspace must be in 1..={MAX_BITS_PER_SUBSPACE}, got {bits}"
            ));
        }
        Ok(())
    }

    /// Trains one L2 k-means codebook per subspace.
    ///
    /// The codebook size is `min(2^bits, residuals.len())`; k-means may return
    /// fewer codewords when a subspace has fewer distinct values.
    /// Parameters must already have passed [`Self::validate_params`].
    pub fn train(
        residuals: &[Vec<f32>],
        subspaces: usize,
        bits: u8,
        seed: u64,
        max_iterations: usize,
    ) -> Result<Self, ClusteringError> {
        if residuals.is_empty() {
            return Err(ClusteringError::EmptyVectorSet);
        }
        let dimension = residuals[0].len();
        let subspace_dim = dimension / subspaces;
        let k = (1usize << bits).min(residuals.len());

        let mut codebooks = Vec::with_capacity(subspaces);
        for s in 0..subspaces {
            let range = s * subspace_dim..(s + 1) * subspace_dim;
            let subvectors: Vec<Vec<f32>> = residuals
                .iter()
                .map(|r| r[range.clone()].to_vec())
                .collect();

            let config = KMeansConfig::new(k, Metric::L2, seed.wrapping_add(s as u64 + 1))
                .with_max_iterations(max_iterations);
            let result = kmeans(&subvectors, &config)?;
            codebooks.push(result.centroids);
        }

        Ok(Self {
            dimension,
            subspaces,
            subspace_dim,
            bits,
            codebooks,
        })
    }

    /// Number of bytes per encoded vector.
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.subspaces
    }

    #[must_use]
    pub fn subspaces(&self) -> usize {
        self.subspaces
    }

    #[must_use]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Codewords held by each subspace.
    pub fn codewords_per_subspace(&self) -> impl Iterator<Item = usize> + '_ {
        self.codebooks.iter().map(Vec::len)
    }

    /// Encodes `vector` into `out`, which must be `code_size()` bytes.
    pub fn encode_into(&self, vector: &[f32], out: &mut [u8]) {
        debug_assert_eq!(vector.len(), self.dimension);
        debug_assert_eq!(out.len(), self.subspaces);
        for (s, code) in out.iter_mut().enumerate() {
            let sub = &vector[s * self.subspace_dim..(s + 1) * self.subspace_dim];
            let (best, _) = nearest_centroid(sub, &self.codebooks[s], Metric::L2);
            *code = best as u8;
        }
    }

    /// Encodes a vector, returning one code per subspace.
    #[must_use]
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = vec![0u8; self.subspaces];
        self.encode_into(vector, &mut codes);
        codes
    }

    /// Reconstructs the approximate vector for a code, or `None` when the
    /// code names a codeword this quantizer does not have.
    #[must_use]
    pub fn decode(&self, codes: &[u8]) -> Option<Vec<f32>> {
        if codes.len() != self.subspaces {
            return None;
        }
        let mut out = Vec::with_capacity(self.dimension);
        for (codebook, &code) in self.codebooks.iter().zip(codes) {
            out.extend_from_slice(codebook.get(code as usize)?);
        }
        Some(out)
    }

    /// Checks that `codes` has one entry per subspace and that each names a
    /// trained codeword.
    pub fn check_codes(&self, codes: &[u8]) -> Result<(), String> {
        if codes.len() != self.subspaces {
            return Err(format!(
                "code has {} bytes, expected {}",
                codes.len(),
                self.subspaces
            ));
        }
        for (s, (codebook, &code)) in self.codebooks.iter().zip(codes).enumerate() {
            if code as usize >= codebook.len() {
                return Err(format!(
                    "code {code} in subspace {s} but only {} codewords exist",
                    codebook.len()
                ));
            }
        }
        Ok(())
    }

    /// Builds the asymmetric inner-product table for a query.
    ///
    /// Layout: `table[s * stride + c] = <query_s, codeword_{s,c}>` with
    /// `stride = 2^bits`; slots past a short codebook stay zero.
    #[must_use]
    pub fn inner_product_table(&self, query: &[f32]) -> Vec<f32> {
        let stride = self.table_stride();
        let mut table = vec![0.0f32; self.subspaces * stride];
        for (s, codebook) in self.codebooks.iter().enumerate() {
            let sub = &query[s * self.subspace_dim..(s + 1) * self.subspace_dim];
            let row = &mut table[s * stride..s * stride + codebook.len()];
            for (slot, codeword) in row.iter_mut().zip(codebook.iter()) {
                *slot = sub.iter().zip(codeword.iter()).map(|(a, b)| a * b).sum();
            }
        }
        table
    }

    /// Scores a code with a table from [`Self::inner_product_table`].
    ///
    /// A code past the end of the table contributes nothing, like an
    /// untrained slot.
    #[inline]
    pub fn table_score(&self, table: &[f32], codes: &[u8]) -> f32 {
        let stride = self.table_stride();
        codes
            .iter()
            .enumerate()
            .map(|(s, &code)| table.get(s * stride + code as usize).copied().unwrap_or(0.0))
            .sum()
    }

    fn table_stride(&self) -> usize {
        1usize << self.bits
    }
}
