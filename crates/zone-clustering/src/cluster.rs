//! K-means clustering of coordinates, exact (Lloyd) or streaming (mini-batch)
//!
//! Both modes share the seeded initialization and the centroid update rule,
//! so a single streaming batch covering the whole input performs exactly one
//! Lloyd step per epoch.
//!
//! Cluster ids are renumbered after fitting in order of first appearance in
//! the input: the first point is always in cluster 0, and realized ids are
//! contiguous from 0.

use crate::{LatLon, Result, ZoneError, DEFAULT_MAX_ITER};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Minimum points per rayon task in the assignment step
const ASSIGN_MIN_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClusterMode {
    /// Recompute centroids from the full input every iteration
    Exact,
    /// Update centroids from in-order batches of at most `batch_size` points
    Streaming { batch_size: usize },
}

fn default_max_iter() -> usize {
    DEFAULT_MAX_ITER
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of clusters
    pub k: usize,
    pub mode: ClusterMode,
    /// Seed for centroid initialization
    pub seed: u64,
    /// Cap on Lloyd iterations (exact) or epochs (streaming)
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
}

impl ClusterConfig {
    pub fn exact(k: usize, seed: u64) -> Self {
        Self {
            k,
            mode: ClusterMode::Exact,
            seed,
            max_iter: DEFAULT_MAX_ITER,
        }
    }

    pub fn streaming(k: usize, batch_size: usize, seed: u64) -> Self {
        Self {
            k,
            mode: ClusterMode::Streaming { batch_size },
            seed,
            max_iter: DEFAULT_MAX_ITER,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(ZoneError::InvalidConfig("k must be at least 1".to_string()));
        }
        if self.max_iter == 0 {
            return Err(ZoneError::InvalidConfig("max_iter must be at least 1".to_string()));
        }
        if let ClusterMode::Streaming { batch_size: 0 } = self.mode {
            return Err(ZoneError::InvalidConfig("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Cluster id per record index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAssignment {
    labels: Vec<usize>,
}

impl ClusterAssignment {
    pub fn from_labels(labels: Vec<usize>) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn get(&self, index: usize) -> Option<usize> {
        self.labels.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Distinct cluster ids, ascending
    pub fn cluster_ids(&self) -> Vec<usize> {
        let mut ids = self.labels.clone();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn member_count(&self, cluster_id: usize) -> usize {
        self.labels.iter().filter(|&&l| l == cluster_id).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCenter {
    pub cluster_id: usize,
    pub centroid: LatLon,
    pub member_count: usize,
}

/// Output of [`ClusterEngine::fit`]
#[derive(Debug, Clone)]
pub struct ClusterFit {
    pub assignment: ClusterAssignment,
    /// Realized clusters only, ascending by id
    pub centers: Vec<ClusterCenter>,
    /// Assignment passes run (iterations or epochs)
    pub iterations: usize,
    /// Stopped before hitting `max_iter`
    pub converged: bool,
    /// Within-cluster sum of squared distances after each assignment pass
    pub inertia_history: Vec<f64>,
}

impl ClusterFit {
    pub fn inertia(&self) -> f64 {
        self.inertia_history.last().copied().unwrap_or(0.0)
    }
}

/// Per-cluster coordinate sums for one update step
struct Accumulator {
    sums: Vec<(f64, f64)>,
    counts: Vec<usize>,
}

impl Accumulator {
    fn new(k: usize) -> Self {
        Self {
            sums: vec![(0.0, 0.0); k],
            counts: vec![0; k],
        }
    }

    fn add(&mut self, label: usize, p: &LatLon) {
        let s = &mut self.sums[label];
        s.0 += p.lat;
        s.1 += p.lon;
        self.counts[label] += 1;
    }

    fn mean(&self, label: usize) -> Option<LatLon> {
        let n = self.counts[label];
        (n > 0).then(|| {
            let (lat, lon) = self.sums[label];
            LatLon::new(lat / n as f64, lon / n as f64)
        })
    }
}

/// Weighted running average of a centroid with a batch mean
fn blend(centroid: LatLon, prior: usize, mean: LatLon, count: usize) -> LatLon {
    if prior == 0 {
        return mean;
    }
    let w_old = prior as f64;
    let w_new = count as f64;
    let total = w_old + w_new;
    LatLon::new(
        (centroid.lat * w_old + mean.lat * w_new) / total,
        (centroid.lon * w_old + mean.lon * w_new) / total,
    )
}

/// Nearest centroid by Euclidean distance; ties go to the lowest id
#[inline]
fn nearest(point: &LatLon, centroids: &[LatLon]) -> (usize, f64) {
    let mut best = 0;
    let mut best_d = point.distance_sq(&centroids[0]);
    for (j, c) in centroids.iter().enumerate().skip(1) {
        let d = point.distance_sq(c);
        if d < best_d {
            best = j;
            best_d = d;
        }
    }
    (best, best_d)
}

/// Assign every point, in parallel over disjoint chunks, results in input order
fn assign(points: &[LatLon], centroids: &[LatLon]) -> Vec<(usize, f64)> {
    points
        .par_iter()
        .with_min_len(ASSIGN_MIN_CHUNK)
        .map(|p| nearest(p, centroids))
        .collect()
}

/// Renumber clusters by first appearance and build the center list
fn canonicalize(labels: &[usize], centroids: &[LatLon]) -> (ClusterAssignment, Vec<ClusterCenter>) {
    let mut remap = vec![usize::MAX; centroids.len()];
    let mut order: Vec<usize> = Vec::new();

    let relabeled: Vec<usize> = labels
        .iter()
        .map(|&l| {
            if remap[l] == usize::MAX {
                remap[l] = order.len();
                order.push(l);
            }
            remap[l]
        })
        .collect();

    let mut counts = vec![0usize; order.len()];
    for &l in &relabeled {
        counts[l] += 1;
    }

    let centers = order
        .iter()
        .enumerate()
        .map(|(cluster_id, &internal)| ClusterCenter {
            cluster_id,
            centroid: centroids[internal],
            member_count: counts[cluster_id],
        })
        .collect();

    (ClusterAssignment::from_labels(relabeled), centers)
}

/// Partitions 2-D coordinates into at most k clusters
#[derive(Debug, Clone)]
pub struct ClusterEngine {
    config: ClusterConfig,
}

impl ClusterEngine {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn fit(&self, points: &[LatLon]) -> Result<ClusterFit> {
        let k = self.config.k;
        if points.len() < k {
            return Err(ZoneError::InsufficientData {
                k,
                points: points.len(),
            });
        }

        info!(
            "Clustering {} points into k={} ({:?}, seed={})",
            points.len(),
            k,
            self.config.mode,
            self.config.seed
        );

        let centroids = self.initial_centroids(points);
        let (centroids, iterations, converged, inertia_history) = match self.config.mode {
            ClusterMode::Exact => self.run_exact(points, centroids),
            ClusterMode::Streaming { batch_size } => self.run_streaming(points, centroids, batch_size),
        };

        // Label every point against the final centroids
        let labels: Vec<usize> = assign(points, &centroids).into_iter().map(|(l, _)| l).collect();
        let (assignment, centers) = canonicalize(&labels, &centroids);

        info!(
            "Clustering finished: {} realized clusters after {} passes (converged={})",
            centers.len(),
            iterations,
            converged
        );

        Ok(ClusterFit {
            assignment,
            centers,
            iterations,
            converged,
            inertia_history,
        })
    }

    /// k distinct input points chosen by the seeded RNG
    fn initial_centroids(&self, points: &[LatLon]) -> Vec<LatLon> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        sample(&mut rng, points.len(), self.config.k)
            .into_iter()
            .map(|i| points[i])
            .collect()
    }

    fn run_exact(&self, points: &[LatLon], mut centroids: Vec<LatLon>) -> (Vec<LatLon>, usize, bool, Vec<f64>) {
        let k = centroids.len();
        let mut previous: Option<Vec<usize>> = None;
        let mut history = Vec::new();
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.config.max_iter {
            iterations += 1;

            let assigned = assign(points, &centroids);
            let inertia: f64 = assigned.iter().map(|(_, d)| d).sum();
            history.push(inertia);
            let labels: Vec<usize> = assigned.into_iter().map(|(l, _)| l).collect();

            if previous.as_ref() == Some(&labels) {
                converged = true;
                break;
            }

            let mut acc = Accumulator::new(k);
            for (p, &l) in points.iter().zip(&labels) {
                acc.add(l, p);
            }
            // Clusters without members keep their centroid
            for (j, c) in centroids.iter_mut().enumerate() {
                if let Some(mean) = acc.mean(j) {
                    *c = mean;
                }
            }

            debug!("Lloyd iteration {}: inertia={:.6}", iterations, inertia);
            previous = Some(labels);
        }

        (centroids, iterations, converged, history)
    }

    fn run_streaming(
        &self,
        points: &[LatLon],
        mut centroids: Vec<LatLon>,
        batch_size: usize,
    ) -> (Vec<LatLon>, usize, bool, Vec<f64>) {
        let k = centroids.len();
        let mut history = Vec::new();
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.config.max_iter {
            iterations += 1;

            let before = centroids.clone();
            // Points folded into each centroid so far this epoch
            let mut seen = vec![0usize; k];
            let mut inertia = 0.0;

            for batch in points.chunks(batch_size) {
                let assigned = assign(batch, &centroids);
                let mut acc = Accumulator::new(k);
                for (p, &(l, d)) in batch.iter().zip(&assigned) {
                    acc.add(l, p);
                    inertia += d;
                }
                for (j, c) in centroids.iter_mut().enumerate() {
                    if let Some(mean) = acc.mean(j) {
                        *c = blend(*c, seen[j], mean, acc.counts[j]);
                        seen[j] += acc.counts[j];
                    }
                }
            }

            history.push(inertia);
            debug!("Streaming epoch {}: inertia={:.6}", iterations, inertia);

            if centroids == before {
                converged = true;
                break;
            }
        }

        (centroids, iterations, converged, history)
    }
}
