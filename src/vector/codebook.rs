//! The trained, frozen codebook: coarse quantizer plus product quantizer.
//!
//! # File Format
//!
//! ```text
//! Header (64 bytes):
//!   magic "IVPQ" | version u32 | dimension u32 | cells u32
//!   subspaces u32 | bits u32 | payload length u64 | fingerprint [u8; 32]
//! Payload: bincode (standard config) of centroids, quantizer and training params
//! ```
//!
//! The fingerprint is the SHA-256 of the payload. Segments and the merged
//! index record it, which ties every build artifact to exactly one codebook.

use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{ErrorContext, IndexError, IndexResult};
use crate::vector::atomic::write_atomically;
use crate::vector::clustering::{argmax_inner_product, inner_product};
use crate::vector::quantizer::ProductQuantizer;
use crate::vector::types::{CellId, VectorDimension};

const MAGIC_BYTES: &[u8; 4] = b"IVPQ";
const CODEBOOK_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;

/// SHA-256 identity of a codebook.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hashes `bytes`.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint '{hex}'")))
    }
}

/// Parameters the codebook was trained with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, bincode::Encode, bincode::Decode)]
pub struct TrainingParams {
    pub cells: u32,
    pub subspaces: u32,
    pub bits_per_subspace: u8,
    pub seed: u64,
    /// Number of vectors in the training sample.
    pub training_samples: u64,
}

#[derive(bincode::Encode, bincode::Decode)]
struct CodebookPayload {
    centroids: Vec<Vec<f32>>,
    pq: ProductQuantizer,
    params: TrainingParams,
}

/// Coarse centroids plus residual product quantizer.
///
/// Immutable once built; shared between workers behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Codebook {
    dimension: VectorDimension,
    centroids: Vec<Vec<f32>>,
    pq: ProductQuantizer,
    params: TrainingParams,
    fingerprint: Fingerprint,
}

impl Codebook {
    /// Assembles a codebook and computes its fingerprint.
    pub fn from_parts(
        centroids: Vec<Vec<f32>>,
        pq: ProductQuantizer,
        params: TrainingParams,
    ) -> IndexResult<Self> {
        let dimension = pq.dimension();
        if centroids.is_empty() || centroids.iter().any(|c| c.len() != dimension) {
            return Err(IndexError::InvalidConfig {
                reason: format!(
                    "codebook needs at least one coarse centroid of dimension {dimension}"
                ),
            });
        }
        let dimension = VectorDimension::new(dimension).map_err(|e| IndexError::InvalidConfig {
            reason: e.to_string(),
        })?;

        let payload = CodebookPayload {
            centroids,
            pq,
            params,
        };
        let bytes = encode_payload(&payload)?;
        Ok(Self {
            dimension,
            fingerprint: Fingerprint::of(&bytes),
            centroids: payload.centroids,
            pq: payload.pq,
            params: payload.params,
        })
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    /// Number of coarse cells (`nlist`).
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.centroids.len()
    }

    /// Bytes per PQ code.
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.pq.code_size()
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    #[must_use]
    pub fn params(&self) -> &TrainingParams {
        &self.params
    }

    #[must_use]
    pub fn quantizer(&self) -> &ProductQuantizer {
        &self.pq
    }

    #[must_use]
    pub fn centroid(&self, cell: CellId) -> &[f32] {
        &self.centroids[cell.index()]
    }

    /// Coarse cell with the largest inner product; ties go to the lower cell.
    #[must_use]
    pub fn assign(&self, vector: &[f32]) -> CellId {
        let (best, _) = argmax_inner_product(vector, &self.centroids);
        CellId::new(best as u32)
    }

    /// Quantizes a vector: nearest cell, then the PQ code of its residual.
    /// `out` must be `code_size()` bytes.
    pub fn encode_into(&self, vector: &[f32], out: &mut [u8]) -> CellId {
        let cell = self.assign(vector);
        let residual: Vec<f32> = vector
            .iter()
            .zip(self.centroid(cell))
            .map(|(v, c)| v - c)
            .collect();
        self.pq.encode_into(&residual, out);
        cell
    }

    #[must_use]
    pub fn encode(&self, vector: &[f32]) -> (CellId, Vec<u8>) {
        let mut code = vec![0u8; self.code_size()];
        let cell = self.encode_into(vector, &mut code);
        (cell, code)
    }

    /// The `nprobe` cells with the highest inner product to `query`, best first,
    /// paired with that inner product. Ties go to the lower cell.
    #[must_use]
    pub fn probe_cells(&self, query: &[f32], nprobe: usize) -> Vec<(CellId, f32)> {
        let mut scored: Vec<(CellId, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (CellId::new(i as u32), inner_product(query, c)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(nprobe.clamp(1, self.centroids.len()));
        scored
    }

    /// Persists the codebook atomically.
    pub fn save(&self, path: &Path) -> IndexResult<()> {
        let payload = CodebookPayload {
            centroids: self.centroids.clone(),
            pq: self.pq.clone(),
            params: self.params.clone(),
        };
        let bytes = encode_payload(&payload)?;

        write_atomically(path, |w| {
            w.write_all(MAGIC_BYTES)?;
            w.write_all(&CODEBOOK_VERSION.to_le_bytes())?;
            w.write_all(&(self.dimension.get() as u32).to_le_bytes())?;
            w.write_all(&(self.centroids.len() as u32).to_le_bytes())?;
            w.write_all(&(self.pq.subspaces() as u32).to_le_bytes())?;
            w.write_all(&u32::from(self.pq.bits()).to_le_bytes())?;
            w.write_all(&(bytes.len() as u64).to_le_bytes())?;
            w.write_all(self.fingerprint.as_bytes())?;
            w.write_all(&bytes)
        })?;

        tracing::debug!(
            "Saved codebook {} ({} cells, {} subspaces) to {}",
            self.fingerprint,
            self.centroids.len(),
            self.pq.subspaces(),
            path.display()
        );
        Ok(())
    }

    /// Loads and verifies a codebook file.
    ///
    /// A missing or unreadable file is `FileRead`; anything malformed is
    /// `IndexCorrupt`.
    pub fn load(path: &Path) -> IndexResult<Self> {
        let data = std::fs::read(path).read_context(path)?;
        let corrupt = |reason: String| IndexError::corrupt(path, reason);

        if data.len() < HEADER_SIZE {
            return Err(corrupt("file too small to contain a codebook header".to_string()));
        }
        if &data[0..4] != MAGIC_BYTES {
            return Err(corrupt("invalid magic bytes".to_string()));
        }
        let version = read_u32(&data, 4);
        if version != CODEBOOK_VERSION {
            return Err(corrupt(format!(
                "unsupported codebook version {version}, expected {CODEBOOK_VERSION}"
            )));
        }
        let dimension = read_u32(&data, 8) as usize;
        let cells = read_u32(&data, 12) as usize;
        let subspaces = read_u32(&data, 16) as usize;
        let bits = read_u32(&data, 20);
        let payload_len = read_u64(&data, 24);
        let mut stored = [0u8; 32];
        stored.copy_from_slice(&data[32..64]);
        let stored = Fingerprint::from_bytes(stored);

        let payload_bytes = &data[HEADER_SIZE..];
        if payload_bytes.len() as u64 != payload_len {
            return Err(corrupt(format!(
                "payload is {} bytes, header says {payload_len}",
                payload_bytes.len()
            )));
        }
        let actual = Fingerprint::of(payload_bytes);
        if actual != stored {
            return Err(corrupt(format!(
                "fingerprint mismatch: header {stored}, payload {actual}"
            )));
        }

        let (payload, consumed): (CodebookPayload, usize) =
            bincode::decode_from_slice(payload_bytes, bincode::config::standard())
                .map_err(|e| corrupt(format!("failed to decode payload: {e}")))?;
        if consumed != payload_bytes.len() {
            return Err(corrupt("trailing bytes after payload".to_string()));
        }

        if payload.pq.dimension() != dimension
            || payload.centroids.len() != cells
            || payload.pq.subspaces() != subspaces
            || u32::from(payload.pq.bits()) != bits
        {
            return Err(corrupt("header disagrees with payload".to_string()));
        }
        if dimension == 0 || payload.centroids.iter().any(|c| c.len() != dimension) {
            return Err(corrupt("coarse centroid dimension mismatch".to_string()));
        }

        Ok(Self {
            dimension: VectorDimension::new(dimension)
                .map_err(|e| corrupt(e.to_string()))?,
            centroids: payload.centroids,
            pq: payload.pq,
            params: payload.params,
            fingerprint: actual,
        })
    }
}

fn encode_payload(payload: &CodebookPayload) -> IndexResult<Vec<u8>> {
    bincode::encode_to_vec(payload, bincode::config::standard()).map_err(|e| {
        IndexError::Serialization {
            path: "codebook".into(),
            reason: e.to_string(),
        }
    })
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
