//! K-means clustering used to train the coarse quantizer and the PQ codebooks.
//!
//! Two flavours share one implementation:
//! - [`Metric::InnerProduct`]: spherical k-means. Centroids are re-normalized
//!   after every update and points go to the centroid with the largest inner
//!   product. Used for the coarse (IVF) quantizer over unit vectors.
//! - [`Metric::L2`]: plain Lloyd's k-means on squared Euclidean distance. Used
//!   for product-quantizer subspaces, whose residual sub-vectors are not unit length.
//!
//! # Algorithm Details
//! - Initialization: K-means++ driven by a seeded RNG, so identical input and
//!   seed give bit-identical centroids
//! - Assignment step runs in parallel with rayon (order preserving)
//! - Empty clusters are re-seeded with the point farthest from its centroid
//! - Stops when assignments no longer change, centroids stop moving, or
//!   `max_iterations` is reached
//!
//! When the input has fewer distinct points than `k`, fewer centroids are
//! returned. Callers decide whether that is acceptable.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

/// Default maximum number of Lloyd iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 25;

/// Convergence tolerance for mean centroid movement.
const CONVERGENCE_TOLERANCE: f32 = 1e-6;

/// K-means++ weights at or below this are treated as "already covered".
const WEIGHT_FLOOR: f64 = 1e-12;

/// Epsilon for floating-point comparisons.
const EPSILON: f32 = 1e-10;

/// Similarity measure used for assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Maximize inner product; centroids are kept unit length.
    InnerProduct,
    /// Minimize squared Euclidean distance.
    L2,
}

impl Metric {
    /// Distance where smaller means closer.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::InnerProduct => (1.0 - inner_product(a, b)).max(0.0),
            Metric::L2 => squared_l2(a, b),
        }
    }

    /// K-means++ sampling weight for a point at distance `d` from its
    /// nearest chosen centroid.
    fn seeding_weight(self, d: f32) -> f64 {
        match self {
            Metric::InnerProduct => f64::from(d) * f64::from(d),
            Metric::L2 => f64::from(d),
        }
    }
}

/// Parameters for a k-means run.
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    /// Requested number of clusters.
    pub k: usize,
    pub metric: Metric,
    pub max_iterations: usize,
    /// Seed for K-means++ initialization.
    pub seed: u64,
}

impl KMeansConfig {
    pub fn new(k: usize, metric: Metric, seed: u64) -> Self {
        Self {
            k,
            metric,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            seed,
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }
}

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster centroids. May hold fewer than `k` entries when the input has
    /// fewer distinct points.
    pub centroids: Vec<Vec<f32>>,

    /// Index into `centroids` for each input vector.
    pub assignments: Vec<usize>,

    /// Number of iterations until convergence.
    pub iterations: usize,
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Ensure vectors are encoded before training"
    )]
    EmptyVectorSet,

    #[error("Invalid cluster count: {0}\nSuggestion: Use k between 1 and the number of vectors")]
    InvalidClusterCount(usize),

    #[error(
        "Dimension mismatch in vectors\nSuggestion: Ensure all vectors come from the same embedding model"
    )]
    DimensionMismatch,
}

/// Runs k-means over `vectors`.
#[must_use = "clustering results should be used or the computation is wasted"]
pub fn kmeans(vectors: &[Vec<f32>], config: &KMeansConfig) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }
    if config.k == 0 || config.k > vectors.len() {
        return Err(ClusteringError::InvalidClusterCount(config.k));
    }
    let dimension = vectors[0].len();
    if dimension == 0 || vectors.iter().any(|v| v.len() != dimension) {
        return Err(ClusteringError::DimensionMismatch);
    }

    let metric = config.metric;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut centroids = initialize_centroids_kmeans_plus_plus(vectors, config.k, metric, &mut rng);
    let mut assignments = assign_all(vectors, &centroids, metric);
    let mut iterations = 0;

    while iterations < config.max_iterations {
        iterations += 1;

        let new_centroids = update_centroids(vectors, &assignments, &centroids, metric);
        let movement = centroid_movement(&centroids, &new_centroids, metric);
        centroids = new_centroids;

        let new_assignments = assign_all(vectors, &centroids, metric);
        let converged = new_assignments == assignments;
        assignments = new_assignments;

        if converged || movement < CONVERGENCE_TOLERANCE {
            break;
        }
    }

    if iterations >= config.max_iterations {
        tracing::debug!(
            "k-means stopped at the iteration cap ({}) with k={}",
            config.max_iterations,
            centroids.len()
        );
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

/// Returns the index of the closest centroid and its distance.
///
/// Ties resolve to the lowest centroid index.
pub fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>], metric: Metric) -> (usize, f32) {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let distance = metric.distance(vector, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = i;
        }
    }
    (best, best_distance)
}

/// Index of the centroid with the largest inner product, and that product.
///
/// Ties resolve to the lowest centroid index.
pub fn argmax_inner_product(vector: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let score = inner_product(vector, centroid);
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    (best, best_score)
}

/// Dot product of two equal-length slices.
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Squared Euclidean distance of two equal-length slices.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Normalizes a vector in-place to unit length.
///
/// Vectors with (near) zero norm are left as-is.
pub fn normalize_vector(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

fn prepare_centroid(vector: &[f32], metric: Metric) -> Vec<f32> {
    let mut centroid = vector.to_vec();
    if metric == Metric::InnerProduct {
        normalize_vector(&mut centroid);
    }
    centroid
}

fn assign_all(vectors: &[Vec<f32>], centroids: &[Vec<f32>], metric: Metric) -> Vec<usize> {
    vectors
        .par_iter()
        .map(|v| nearest_centroid(v, centroids, metric).0)
        .collect()
}

/// K-means++ seeding. Stops early when every remaining point coincides with
/// an already chosen centroid.
fn initialize_centroids_kmeans_plus_plus(
    vectors: &[Vec<f32>],
    k: usize,
    metric: Metric,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    let first = rng.random_range(0..vectors.len());
    let mut centroids = Vec::with_capacity(k);
    centroids.push(prepare_centroid(&vectors[first], metric));

    let mut weights: Vec<f64> = vectors
        .iter()
        .map(|v| metric.seeding_weight(metric.distance(v, &centroids[0])))
        .collect();
    weights[first] = 0.0;

    while centroids.len() < k {
        let total: f64 = weights.iter().filter(|&&w| w > WEIGHT_FLOOR).sum();
        if total <= WEIGHT_FLOOR {
            break;
        }

        let target = rng.random::<f64>() * total;
        let mut cumulative = 0.0;
        let mut chosen = None;
        for (i, &w) in weights.iter().enumerate() {
            if w <= WEIGHT_FLOOR {
                continue;
            }
            cumulative += w;
            chosen = Some(i);
            if cumulative >= target {
                break;
            }
        }

        // `total > WEIGHT_FLOOR` guarantees at least one candidate
        let Some(index) = chosen else { break };
        let centroid = prepare_centroid(&vectors[index], metric);
        for (weight, vector) in weights.iter_mut().zip(vectors.iter()) {
            let w = metric.seeding_weight(metric.distance(vector, &centroid));
            if w < *weight {
                *weight = w;
            }
        }
        weights[index] = 0.0;
        centroids.push(centroid);
    }

    centroids
}

/// Recomputes centroids as the mean of their members.
fn update_centroids(
    vectors: &[Vec<f32>],
    assignments: &[usize],
    previous: &[Vec<f32>],
    metric: Metric,
) -> Vec<Vec<f32>> {
    let k = previous.len();
    let dimension = vectors[0].len();
    let mut sums = vec![vec![0.0f32; dimension]; k];
    let mut sizes = vec![0usize; k];

    for (vector, &cluster) in vectors.iter().zip(assignments.iter()) {
        for (acc, &value) in sums[cluster].iter_mut().zip(vector.iter()) {
            *acc += value;
        }
        sizes[cluster] += 1;
    }

    let mut taken: Vec<usize> = Vec::new();
    for cluster in 0..k {
        if sizes[cluster] == 0 {
            // Re-seed with the worst-served point not already used for re-seeding
            let farthest = vectors
                .iter()
                .zip(assignments.iter())
                .enumerate()
                .filter(|(i, _)| !taken.contains(i))
                .map(|(i, (v, &a))| (i, metric.distance(v, &previous[a])))
                .filter(|(_, d)| *d > EPSILON)
                .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
            sums[cluster] = match farthest {
                Some((i, _)) => {
                    taken.push(i);
                    prepare_centroid(&vectors[i], metric)
                }
                None => previous[cluster].clone(),
            };
            continue;
        }

        let inv = 1.0 / sizes[cluster] as f32;
        for value in sums[cluster].iter_mut() {
            *value *= inv;
        }
        if metric == Metric::InnerProduct {
            normalize_vector(&mut sums[cluster]);
        }
    }

    sums
}

/// Mean movement of centroids between iterations.
fn centroid_movement(old: &[Vec<f32>], new: &[Vec<f32>], metric: Metric) -> f32 {
    old.iter()
        .zip(new.iter())
        .map(|(o, n)| metric.distance(o, n))
        .sum::<f32>()
        / old.len() as f32
}
