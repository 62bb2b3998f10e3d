use faer::MatRef;
use log::info;
use rayon::prelude::*;
use std::time::Instant;

use crate::core::graph::annoy::AnnoyIndex;
use crate::error::{Result, ScrubletError};

///////////
// Enums //
///////////

/// Distance metrics for the kNN search
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceMetric {
    /// L2 distance
    Euclidean,
    /// L1 distance
    Manhattan,
    /// One minus the cosine similarity (also known as angular)
    Cosine,
    /// L-infinity distance
    Chebyshev,
    /// Negative inner product
    Dot,
}

impl DistanceMetric {
    /// Canonical name of the metric
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::Manhattan => "manhattan",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Chebyshev => "chebyshev",
            DistanceMetric::Dot => "dot",
        }
    }

    /// Can the brute force search use this metric
    pub fn supported_by_exact(&self) -> bool {
        !matches!(self, DistanceMetric::Dot)
    }

    /// Can the Annoy forest use this metric
    pub fn supported_by_annoy(&self) -> bool {
        !matches!(self, DistanceMetric::Chebyshev)
    }

    /// Distance between two vectors
    ///
    /// For cosine, a zero vector has distance 1 to everything.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            DistanceMetric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
            DistanceMetric::Chebyshev => a
                .iter()
                .zip(b)
                .fold(0.0_f32, |acc, (x, y)| acc.max((x - y).abs())),
            DistanceMetric::Cosine => {
                let (dot, norm_a, norm_b) = a
                    .iter()
                    .zip(b)
                    .fold((0.0_f32, 0.0_f32, 0.0_f32), |(d, na, nb), (x, y)| {
                        (d + x * y, na + x * x, nb + y * y)
                    });
                let denom = norm_a.sqrt() * norm_b.sqrt();
                if denom > 0.0 {
                    1.0 - dot / denom
                } else {
                    1.0
                }
            }
            DistanceMetric::Dot => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        }
    }
}

/////////////
// Helpers //
/////////////

/// Helper function to get the distance metric
///
/// ### Params
///
/// * `s` - Name of the metric. `"angular"` is an alias for `"cosine"`.
///
/// ### Returns
///
/// Option of the DistanceMetric
pub fn parse_distance_metric(s: &str) -> Option<DistanceMetric> {
    match s.to_lowercase().as_str() {
        "euclidean" => Some(DistanceMetric::Euclidean),
        "manhattan" => Some(DistanceMetric::Manhattan),
        "cosine" | "angular" => Some(DistanceMetric::Cosine),
        "chebyshev" => Some(DistanceMetric::Chebyshev),
        "dot" => Some(DistanceMetric::Dot),
        _ => None,
    }
}

/// Default number of neighbours: `round(0.5 * sqrt(n_obs))`, at least 1
pub fn default_k(n_obs: usize) -> usize {
    ((0.5 * (n_obs as f64).sqrt()).round() as usize).max(1)
}

/// Number of neighbours adjusted for the simulated doublets
///
/// ### Params
///
/// * `k` - Number of neighbours requested per observed cell.
/// * `n_obs` - Number of observed cells.
/// * `n_sim` - Number of simulated doublets.
///
/// ### Returns
///
/// `round(k * (1 + n_sim / n_obs))`
pub fn calculate_k_adj(k: usize, n_obs: usize, n_sim: usize) -> usize {
    let r = n_sim as f64 / n_obs as f64;
    (k as f64 * (1.0 + r)).round() as usize
}

////////////
// Params //
////////////

/// Parameters for the kNN graph generation
///
/// ### Fields
///
/// * `k` - Number of neighbours per observed cell. `None` uses
///   `round(0.5 * sqrt(n_obs))`.
/// * `use_approx_neighbours` - Use the Annoy forest instead of the exact
///   search.
/// * `dist_metric` - Name of the distance metric.
/// * `n_trees` - Number of trees for the Annoy forest.
/// * `search_budget` - Number of candidates inspected per Annoy query. `None`
///   uses `k * n_trees`.
#[derive(Clone, Debug)]
pub struct KnnParams {
    pub k: Option<usize>,
    pub use_approx_neighbours: bool,
    pub dist_metric: String,
    pub n_trees: usize,
    pub search_budget: Option<usize>,
}

impl Default for KnnParams {
    fn default() -> Self {
        Self {
            k: None,
            use_approx_neighbours: true,
            dist_metric: "euclidean".to_string(),
            n_trees: 10,
            search_budget: None,
        }
    }
}

impl KnnParams {
    /// Resolve the metric and the backend
    ///
    /// ### Params
    ///
    /// * `seed` - Seed for the Annoy forest.
    ///
    /// ### Returns
    ///
    /// The neighbour search backend or an error if the metric is unknown or
    /// not supported by the selected backend.
    pub fn neighbour_search(&self, seed: u64) -> Result<Box<dyn NeighbourSearch>> {
        let metric = parse_distance_metric(&self.dist_metric)
            .ok_or_else(|| ScrubletError::UnknownMetric(self.dist_metric.clone()))?;

        if self.use_approx_neighbours {
            if !metric.supported_by_annoy() {
                return Err(ScrubletError::UnsupportedMetric {
                    metric: metric.name().to_string(),
                    backend: "annoy",
                });
            }
            if self.n_trees == 0 {
                return Err(ScrubletError::param("n_trees must be at least 1"));
            }
            Ok(Box::new(AnnoySearch {
                metric,
                n_trees: self.n_trees,
                search_budget: self.search_budget,
                seed,
            }))
        } else {
            if !metric.supported_by_exact() {
                return Err(ScrubletError::UnsupportedMetric {
                    metric: metric.name().to_string(),
                    backend: "exact",
                });
            }
            Ok(Box::new(ExactSearch { metric }))
        }
    }
}

//////////////
// Backends //
//////////////

/// A kNN search over the rows of an embedding
pub trait NeighbourSearch: Send + Sync {
    /// Name of the backend
    fn name(&self) -> &'static str;

    /// Find the `k` nearest neighbours of every row, excluding the row itself
    ///
    /// ### Params
    ///
    /// * `embedding` - Matrix with rows = samples and columns = features.
    /// * `k` - Number of neighbours. Must be smaller than the number of rows.
    ///
    /// ### Returns
    ///
    /// Per row the neighbour indices sorted by distance.
    fn search(&self, embedding: MatRef<f32>, k: usize) -> Result<Vec<Vec<usize>>>;
}

/// Brute force search; ties are broken by the lower index
#[derive(Clone, Debug)]
pub struct ExactSearch {
    pub metric: DistanceMetric,
}

/// Approximate search via a random-hyperplane forest
#[derive(Clone, Debug)]
pub struct AnnoySearch {
    pub metric: DistanceMetric,
    pub n_trees: usize,
    pub search_budget: Option<usize>,
    pub seed: u64,
}

impl NeighbourSearch for ExactSearch {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn search(&self, embedding: MatRef<f32>, k: usize) -> Result<Vec<Vec<usize>>> {
        check_k(embedding.nrows(), k)?;

        let rows: Vec<Vec<f32>> = (0..embedding.nrows())
            .map(|i| embedding.row(i).iter().copied().collect())
            .collect();

        let res: Vec<Vec<usize>> = rows
            .par_iter()
            .enumerate()
            .map(|(i, query)| {
                let mut scored: Vec<(usize, f32)> = rows
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .map(|(j, v)| (j, self.metric.distance(query, v)))
                    .collect();

                let cmp = |a: &(usize, f32), b: &(usize, f32)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
                if k < scored.len() {
                    scored.select_nth_unstable_by(k - 1, cmp);
                    scored.truncate(k);
                }
                scored.sort_unstable_by(cmp);
                scored.into_iter().map(|(j, _)| j).collect()
            })
            .collect();

        Ok(res)
    }
}

impl NeighbourSearch for AnnoySearch {
    fn name(&self) -> &'static str {
        "annoy"
    }

    fn search(&self, embedding: MatRef<f32>, k: usize) -> Result<Vec<Vec<usize>>> {
        check_k(embedding.nrows(), k)?;

        let index = AnnoyIndex::new(embedding, self.n_trees, self.seed, self.metric)?;

        let res: Vec<Vec<usize>> = (0..index.len())
            .into_par_iter()
            .map(|i| index.query_item(i, k, self.search_budget).0)
            .collect();

        Ok(res)
    }
}

fn check_k(n_points: usize, k: usize) -> Result<()> {
    if k == 0 || k >= n_points {
        return Err(ScrubletError::param(format!(
            "Number of neighbours ({}) must be in [1, {}) for {} points",
            k, n_points, n_points
        )));
    }
    Ok(())
}

////////////////////
// Main functions //
////////////////////

/// Build the kNN graph over the pooled embedding
///
/// ### Params
///
/// * `embedding` - Pooled embedding (observed cells first, then the
///   simulated doublets).
/// * `k_adj` - Number of neighbours per point.
/// * `params` - The kNN parameters.
/// * `seed` - Seed for the approximate backend.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// Per pooled point the `k_adj` neighbour indices, self excluded.
pub fn build_knn_graph(
    embedding: MatRef<f32>,
    k_adj: usize,
    params: &KnnParams,
    seed: u64,
    verbose: bool,
) -> Result<Vec<Vec<usize>>> {
    let backend = params.neighbour_search(seed)?;

    let start = Instant::now();
    let knn = backend.search(embedding, k_adj)?;
    let end = start.elapsed();

    if verbose {
        info!(
            "kNN graph ({} backend, k = {}) on {} points: {:.2?}",
            backend.name(),
            k_adj,
            embedding.nrows(),
            end
        );
    }

    Ok(knn)
}

///////////
// Tests //
///////////
