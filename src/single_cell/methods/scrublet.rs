use faer::{concat, Mat, MatRef};
use log::{info, warn};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::time::Instant;

use crate::core::base::pca_svd::{
    ManifoldEmbedder, PcaEmbedder, SvdSolver, TruncatedSvdEmbedder,
};
use crate::core::base::stats::histogram;
use crate::core::data::sparse_structures::{CountMatrix, GeneFilter};
use crate::core::graph::knn::{build_knn_graph, calculate_k_adj, default_k, KnnParams};
use crate::error::{Result, ScrubletError};
use crate::single_cell::doublet_sim::{simulate_doublets, SimulatedDoublets};
use crate::single_cell::hvg::{get_gene_filter, GeneFilterParams};
use crate::single_cell::processing::{
    log_transform, median_total, normalise_total, GeneScaler, ScalingMode,
};
use crate::utils::general::count_true;

/// Maximum number of smoothing rounds of the threshold search
const MAX_SMOOTHING_ITER: usize = 10_000;

////////////
// Params //
////////////

/// Structure that stores the Scrublet parameters
///
/// ### Fields
///
/// **General parameters:**
///
/// * `log_transform` - Shall the normalised counts be log-transformed
///   (`ln(1 + x)`) before the embedding.
/// * `mean_center` - Shall the genes be mean-centred. Selects PCA (centred)
///   over truncated SVD (uncentred) for the embedding.
/// * `normalise_variance` - Shall the genes be scaled to unit variance.
/// * `target_size` - Library size both populations are normalised to before
///   the embedding.
///
/// **Gene filter:**
///
/// * `min_counts` - Minimum normalised value for a cell to count as
///   expressing a gene.
/// * `min_cells` - Minimum number of expressing cells per gene.
/// * `min_gene_var_pctl` - Percentile of the v-scores a gene needs to reach.
///
/// **Doublet generation:**
///
/// * `sim_doublet_ratio` - Number of doublets to simulate relative to the
///   number of observed cells.
/// * `synthetic_doublet_umi_subsampling` - Rate of binomial thinning of the
///   simulated doublet counts. 1.0 means no thinning.
/// * `expected_doublet_rate` - Prior of the doublet rate.
/// * `stdev_doublet_rate` - Uncertainty of the prior.
///
/// **Embedding:**
///
/// * `no_pcs` - Number of components of the embedding.
/// * `random_svd` - Use the randomised SVD (faster) instead of the exact one.
///
/// **kNN graph:**
///
/// * `knn_params` - The `KnnParams`.
///
/// **Doublet calling:**
///
/// * `n_bins` - Number of histogram bins for the threshold search.
/// * `manual_threshold` - Optional threshold. Skips the automatic search.
/// * `get_doublet_neighbour_parents` - Report for each observed cell the
///   parents of its simulated neighbours.
///
/// **Other:**
///
/// * `seed` - Seed for the doublet simulation, randomised SVD and Annoy.
/// * `verbose` - Controls verbosity.
#[derive(Clone, Debug)]
pub struct ScrubletParams {
    // general
    pub log_transform: bool,
    pub mean_center: bool,
    pub normalise_variance: bool,
    pub target_size: f32,
    // gene filter
    pub min_counts: f32,
    pub min_cells: usize,
    pub min_gene_var_pctl: f64,
    // doublet generation
    pub sim_doublet_ratio: f64,
    pub synthetic_doublet_umi_subsampling: f64,
    pub expected_doublet_rate: f64,
    pub stdev_doublet_rate: f64,
    // embedding
    pub no_pcs: usize,
    pub random_svd: bool,
    // knn
    pub knn_params: KnnParams,
    // calling
    pub n_bins: usize,
    pub manual_threshold: Option<f64>,
    pub get_doublet_neighbour_parents: bool,
    // other
    pub seed: u64,
    pub verbose: bool,
}

impl Default for ScrubletParams {
    fn default() -> Self {
        Self {
            log_transform: false,
            mean_center: true,
            normalise_variance: true,
            target_size: 1e6,
            min_counts: 3.0,
            min_cells: 3,
            min_gene_var_pctl: 85.0,
            sim_doublet_ratio: 2.0,
            synthetic_doublet_umi_subsampling: 1.0,
            expected_doublet_rate: 0.05,
            stdev_doublet_rate: 0.02,
            no_pcs: 30,
            random_svd: false,
            knn_params: KnnParams::default(),
            n_bins: 256,
            manual_threshold: None,
            get_doublet_neighbour_parents: false,
            seed: 0,
            verbose: false,
        }
    }
}

impl ScrubletParams {
    /// Check all parameters before anything runs
    ///
    /// ### Returns
    ///
    /// An error describing the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        if !(self.sim_doublet_ratio.is_finite() && self.sim_doublet_ratio > 0.0) {
            return Err(ScrubletError::param(format!(
                "sim_doublet_ratio must be positive, got {}",
                self.sim_doublet_ratio
            )));
        }
        let s = self.synthetic_doublet_umi_subsampling;
        if s.is_nan() || s <= 0.0 || s > 1.0 {
            return Err(ScrubletError::param(format!(
                "synthetic_doublet_umi_subsampling must be in (0, 1], got {}",
                s
            )));
        }
        let rho = self.expected_doublet_rate;
        if rho.is_nan() || rho <= 0.0 || rho >= 1.0 {
            return Err(ScrubletError::param(format!(
                "expected_doublet_rate must be in (0, 1), got {}",
                rho
            )));
        }
        let se_rho = self.stdev_doublet_rate;
        if se_rho.is_nan() || !(0.0..1.0).contains(&se_rho) {
            return Err(ScrubletError::param(format!(
                "stdev_doublet_rate must be in [0, 1), got {}",
                se_rho
            )));
        }
        if !(self.target_size.is_finite() && self.target_size > 0.0) {
            return Err(ScrubletError::param("target_size must be positive"));
        }
        if self.min_gene_var_pctl.is_nan() || !(0.0..=100.0).contains(&self.min_gene_var_pctl) {
            return Err(ScrubletError::param(
                "min_gene_var_pctl must be in [0, 100]",
            ));
        }
        if self.no_pcs == 0 {
            return Err(ScrubletError::param("no_pcs must be at least 1"));
        }
        if self.n_bins < 2 {
            return Err(ScrubletError::param("n_bins must be at least 2"));
        }
        if self.knn_params.k == Some(0) {
            return Err(ScrubletError::param("k must be at least 1"));
        }
        if let Some(t) = self.manual_threshold {
            if !t.is_finite() {
                return Err(ScrubletError::param(format!(
                    "manual_threshold must be finite, got {}",
                    t
                )));
            }
        }
        // resolves the metric against the backend
        self.knn_params.neighbour_search(self.seed)?;

        Ok(())
    }

    fn gene_filter_params(&self) -> GeneFilterParams {
        GeneFilterParams {
            min_counts: self.min_counts,
            min_cells: self.min_cells,
            min_gene_var_pctl: self.min_gene_var_pctl,
        }
    }
}

/// Parameters of a run, reported alongside the results
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScrubletParamsRecord {
    pub sim_doublet_ratio: f64,
    pub n_neighbors: usize,
    pub expected_doublet_rate: f64,
    pub stdev_doublet_rate: f64,
    pub synthetic_doublet_umi_subsampling: f64,
    pub dist_metric: String,
    pub use_approx_neighbours: bool,
    pub seed: u64,
}

/////////////
// Results //
/////////////

/// Outcome of the doublet calling
#[derive(Clone, Debug, PartialEq)]
pub enum DoubletCall {
    /// A threshold was found (or given)
    ///
    /// ### Fields
    ///
    /// * `threshold` - Doublet score threshold.
    /// * `predicted_doublets` - `score > threshold` per observed cell.
    /// * `z_scores` - `(score - threshold) / error` per observed cell.
    /// * `detected_doublet_rate` - Fraction of observed cells called.
    /// * `detectable_doublet_fraction` - Fraction of simulated doublets
    ///   above the threshold.
    /// * `overall_doublet_rate` - Detected rate over detectable fraction.
    ///   Infinite or NaN if no simulated doublet is detectable.
    Calibrated {
        threshold: f64,
        predicted_doublets: Vec<bool>,
        z_scores: Vec<f64>,
        detected_doublet_rate: f64,
        detectable_doublet_fraction: f64,
        overall_doublet_rate: f64,
    },
    /// The simulated scores were not bimodal; no prediction was made
    Uncalibrated,
}

impl DoubletCall {
    /// The threshold, if calibration succeeded
    pub fn threshold(&self) -> Option<f64> {
        match self {
            DoubletCall::Calibrated { threshold, .. } => Some(*threshold),
            DoubletCall::Uncalibrated => None,
        }
    }

    /// Did the calibration succeed
    pub fn is_calibrated(&self) -> bool {
        matches!(self, DoubletCall::Calibrated { .. })
    }
}

/// Doublet scores and their standard errors of both populations
#[derive(Clone, Debug)]
pub struct DoubletScores {
    pub scores_obs: Vec<f64>,
    pub errors_obs: Vec<f64>,
    pub scores_sim: Vec<f64>,
    pub errors_sim: Vec<f64>,
}

/// Result structure for Scrublet
///
/// ### Fields
///
/// * `doublet_scores_obs` - Doublet score per observed cell.
/// * `doublet_errors_obs` - Standard error of the observed scores.
/// * `doublet_scores_sim` - Doublet score per simulated doublet.
/// * `doublet_errors_sim` - Standard error of the simulated scores.
/// * `doublet_parents` - Parent pair of each simulated doublet.
/// * `call` - The `DoubletCall`.
/// * `doublet_neighbour_parents` - Optional parents of the simulated
///   neighbours of each observed cell (sorted, unique).
/// * `manifold_obs` - Embedding of the observed cells.
/// * `manifold_sim` - Embedding of the simulated doublets.
/// * `k_adj` - Number of neighbours in the kNN graph.
/// * `params` - The `ScrubletParamsRecord`.
#[derive(Clone, Debug)]
pub struct ScrubletResult {
    pub doublet_scores_obs: Vec<f64>,
    pub doublet_errors_obs: Vec<f64>,
    pub doublet_scores_sim: Vec<f64>,
    pub doublet_errors_sim: Vec<f64>,
    pub doublet_parents: Vec<(usize, usize)>,
    pub call: DoubletCall,
    pub doublet_neighbour_parents: Option<Vec<Vec<usize>>>,
    pub manifold_obs: Mat<f32>,
    pub manifold_sim: Mat<f32>,
    pub k_adj: usize,
    pub params: ScrubletParamsRecord,
}

impl ScrubletResult {
    /// Doublet predictions; all `false` if the calibration failed
    pub fn predicted_doublets(&self) -> Vec<bool> {
        match &self.call {
            DoubletCall::Calibrated {
                predicted_doublets, ..
            } => predicted_doublets.clone(),
            DoubletCall::Uncalibrated => vec![false; self.doublet_scores_obs.len()],
        }
    }

    /// The threshold, if calibration succeeded
    pub fn threshold(&self) -> Option<f64> {
        self.call.threshold()
    }

    /// Re-call the doublets with an explicit threshold
    ///
    /// ### Params
    ///
    /// * `threshold` - The doublet score threshold.
    ///
    /// ### Returns
    ///
    /// The result with the new `DoubletCall`; the scores stay untouched. An
    /// error if the threshold is not finite.
    pub fn with_threshold(mut self, threshold: f64) -> Result<Self> {
        if !threshold.is_finite() {
            return Err(ScrubletError::param(format!(
                "threshold must be finite, got {}",
                threshold
            )));
        }
        self.call = call_doublets(
            &self.doublet_scores_obs,
            &self.doublet_errors_obs,
            &self.doublet_scores_sim,
            CallParams {
                manual_threshold: Some(threshold),
                n_bins: 2,
                expected_doublet_rate: self.params.expected_doublet_rate,
                verbose: false,
            },
        );
        Ok(self)
    }
}

/// Result of a batched run
///
/// ### Fields
///
/// * `doublet_scores_obs` - Scores of all cells in the original order.
/// * `doublet_errors_obs` - Errors of all cells in the original order.
/// * `predicted_doublets` - Predictions of all cells in the original order.
///   `false` for cells of uncalibrated batches.
/// * `batches` - The `ScrubletBatch` results, sorted by label.
#[derive(Clone, Debug)]
pub struct BatchedScrubletResult {
    pub doublet_scores_obs: Vec<f64>,
    pub doublet_errors_obs: Vec<f64>,
    pub predicted_doublets: Vec<bool>,
    pub batches: Vec<ScrubletBatch>,
}

/// Result of a single batch
///
/// ### Fields
///
/// * `label` - The batch label.
/// * `cell_indices` - Original row indices of the cells in the batch.
/// * `result` - The `ScrubletResult` of the batch.
#[derive(Clone, Debug)]
pub struct ScrubletBatch {
    pub label: String,
    pub cell_indices: Vec<usize>,
    pub result: ScrubletResult,
}

////////////////////
// Pipeline steps //
////////////////////

/// Entry point of the pipeline; holds the raw observed counts
pub struct Scrublet {
    counts: CountMatrix,
    params: ScrubletParams,
}

/// Observed counts restricted to the retained genes
pub struct GeneFiltered {
    observed: CountMatrix,
    gene_filter: GeneFilter,
    params: ScrubletParams,
}

/// Observed counts plus the simulated doublets
pub struct DoubletsSimulated {
    observed: CountMatrix,
    simulated: SimulatedDoublets,
    gene_filter: GeneFilter,
    params: ScrubletParams,
}

/// Both populations in the shared low dimensional space
pub struct Embedded {
    manifold_obs: Mat<f32>,
    manifold_sim: Mat<f32>,
    parents: Vec<(usize, usize)>,
    params: ScrubletParams,
}

/// Doublet scores from the joint kNN graph
pub struct Scored {
    scores: DoubletScores,
    neighbour_parents: Option<Vec<Vec<usize>>>,
    k: usize,
    k_adj: usize,
    embedded: Embedded,
}

impl Scrublet {
    /// Generate a new instance
    ///
    /// ### Params
    ///
    /// * `counts` - Raw counts (cells x genes) with their library sizes.
    /// * `params` - The Scrublet parameters.
    ///
    /// ### Returns
    ///
    /// The pipeline or an error if the parameters are invalid.
    pub fn new(counts: CountMatrix, params: ScrubletParams) -> Result<Self> {
        params.validate()?;
        if counts.n_cells() == 0 || counts.n_genes() == 0 {
            return Err(ScrubletError::param("count matrix is empty"));
        }
        Ok(Self { counts, params })
    }

    /// Select the expressed, highly variable genes
    ///
    /// The gene filter is derived from the observed counts normalised to
    /// the median library size.
    pub fn filter_genes(self) -> Result<GeneFiltered> {
        let start = Instant::now();

        let target = median_total(&self.counts);
        let normalised = normalise_total(&self.counts, target);
        let gene_filter = get_gene_filter(
            &normalised,
            &self.params.gene_filter_params(),
            self.params.verbose,
        )?;
        let observed = self.counts.select_genes(&gene_filter);

        if self.params.verbose {
            info!(
                "Using {} of {} genes. Done in {:.2?}",
                gene_filter.len(),
                self.counts.n_genes(),
                start.elapsed()
            );
        }

        Ok(GeneFiltered {
            observed,
            gene_filter,
            params: self.params,
        })
    }
}

impl GeneFiltered {
    /// The retained genes
    pub fn gene_filter(&self) -> &GeneFilter {
        &self.gene_filter
    }

    /// Simulate doublets from the gene filtered raw counts
    pub fn simulate_doublets(self) -> Result<DoubletsSimulated> {
        let start = Instant::now();

        let simulated = simulate_doublets(
            &self.observed,
            self.params.sim_doublet_ratio,
            self.params.synthetic_doublet_umi_subsampling,
            self.params.seed,
        )?;

        if self.params.verbose {
            info!(
                "Simulated {} doublets. Done in {:.2?}",
                simulated.len(),
                start.elapsed()
            );
        }

        Ok(DoubletsSimulated {
            observed: self.observed,
            simulated,
            gene_filter: self.gene_filter,
            params: self.params,
        })
    }
}

impl DoubletsSimulated {
    /// The retained genes
    pub fn gene_filter(&self) -> &GeneFilter {
        &self.gene_filter
    }

    /// The simulated doublets
    pub fn simulated(&self) -> &SimulatedDoublets {
        &self.simulated
    }

    /// Normalise, scale and embed both populations
    ///
    /// Every statistic (gene means, standard deviations, the projection) is
    /// fitted on the observed cells only and applied to both populations.
    pub fn embed(self) -> Result<Embedded> {
        let start = Instant::now();
        let params = &self.params;

        let mut norm_obs = normalise_total(&self.observed, params.target_size);
        let mut norm_sim = normalise_total(&self.simulated.counts, params.target_size);
        if params.log_transform {
            norm_obs = log_transform(&norm_obs);
            norm_sim = log_transform(&norm_sim);
        }

        let mode = ScalingMode::from_flags(params.mean_center, params.normalise_variance);
        let scaler = GeneScaler::fit(&norm_obs, mode);
        let dense_obs = scaler.transform(&norm_obs)?;
        let dense_sim = scaler.transform(&norm_sim)?;

        let max_components = dense_obs.nrows().min(dense_obs.ncols());
        let n_components = if params.no_pcs > max_components {
            warn!(
                "Requested {} components, but only {} are possible; using {}",
                params.no_pcs, max_components, max_components
            );
            max_components
        } else {
            params.no_pcs
        };

        let solver = if params.random_svd {
            SvdSolver::Randomised { seed: params.seed }
        } else {
            SvdSolver::Exact
        };
        let embedder: Box<dyn ManifoldEmbedder> = if mode.centres() {
            Box::new(PcaEmbedder {
                n_components,
                solver,
            })
        } else {
            Box::new(TruncatedSvdEmbedder {
                n_components,
                solver,
            })
        };

        let (projection, manifold_obs) = embedder.fit_transform(dense_obs.as_ref())?;
        let manifold_sim = projection.transform(dense_sim.as_ref())?;

        if params.verbose {
            info!(
                "Embedded {} + {} cells into {} dimensions. Done in {:.2?}",
                manifold_obs.nrows(),
                manifold_sim.nrows(),
                n_components,
                start.elapsed()
            );
        }

        Ok(Embedded {
            manifold_obs,
            manifold_sim,
            parents: self.simulated.parents,
            params: self.params,
        })
    }
}

impl Embedded {
    /// Start the pipeline from an externally supplied embedding
    ///
    /// ### Params
    ///
    /// * `manifold_obs` - Embedding of the observed cells.
    /// * `manifold_sim` - Embedding of the simulated doublets in the same
    ///   space.
    /// * `parents` - Parent pair of each simulated doublet.
    /// * `params` - The Scrublet parameters.
    ///
    /// ### Returns
    ///
    /// The pipeline state ready for scoring.
    pub fn from_manifold(
        manifold_obs: Mat<f32>,
        manifold_sim: Mat<f32>,
        parents: Vec<(usize, usize)>,
        params: ScrubletParams,
    ) -> Result<Self> {
        params.validate()?;
        crate::ensure_same_ncols!(manifold_obs, manifold_sim);
        if manifold_obs.nrows() == 0 || manifold_sim.nrows() == 0 {
            return Err(ScrubletError::param(
                "both embeddings need at least one cell",
            ));
        }
        if parents.len() != manifold_sim.nrows() {
            return Err(ScrubletError::Dimension(format!(
                "{} doublet parents for {} simulated doublets",
                parents.len(),
                manifold_sim.nrows()
            )));
        }
        let n_obs = manifold_obs.nrows();
        if parents.iter().any(|&(i, j)| i >= n_obs || j >= n_obs) {
            return Err(ScrubletError::Dimension(
                "doublet parent index out of bounds".to_string(),
            ));
        }

        Ok(Self {
            manifold_obs,
            manifold_sim,
            parents,
            params,
        })
    }

    /// Embedding of the observed cells
    pub fn manifold_obs(&self) -> MatRef<'_, f32> {
        self.manifold_obs.as_ref()
    }

    /// Embedding of the simulated doublets
    pub fn manifold_sim(&self) -> MatRef<'_, f32> {
        self.manifold_sim.as_ref()
    }

    /// Build the joint kNN graph and score every cell
    pub fn score(self) -> Result<Scored> {
        let start = Instant::now();

        let n_obs = self.manifold_obs.nrows();
        let n_sim = self.manifold_sim.nrows();
        let k = self.params.knn_params.k.unwrap_or_else(|| default_k(n_obs));
        let k_adj = calculate_k_adj(k, n_obs, n_sim);

        let pooled: Mat<f32> = concat![[self.manifold_obs.as_ref()], [self.manifold_sim.as_ref()]];
        let knn = build_knn_graph(
            pooled.as_ref(),
            k_adj,
            &self.params.knn_params,
            self.params.seed,
            self.params.verbose,
        )?;

        let scores = calculate_doublet_scores(
            &knn,
            n_obs,
            n_sim,
            self.params.expected_doublet_rate,
            self.params.stdev_doublet_rate,
        );
        let neighbour_parents = self
            .params
            .get_doublet_neighbour_parents
            .then(|| doublet_neighbour_parents(&knn, n_obs, &self.parents));

        if self.params.verbose {
            info!("Calculated doublet scores. Done in {:.2?}", start.elapsed());
        }

        Ok(Scored {
            scores,
            neighbour_parents,
            k,
            k_adj,
            embedded: self,
        })
    }
}

impl Scored {
    /// The doublet scores
    pub fn scores(&self) -> &DoubletScores {
        &self.scores
    }

    /// Number of neighbours in the kNN graph
    pub fn k_adj(&self) -> usize {
        self.k_adj
    }

    /// Call the doublets and assemble the final result
    pub fn call_doublets(self) -> ScrubletResult {
        let params = &self.embedded.params;

        let call = call_doublets(
            &self.scores.scores_obs,
            &self.scores.errors_obs,
            &self.scores.scores_sim,
            CallParams {
                manual_threshold: params.manual_threshold,
                n_bins: params.n_bins,
                expected_doublet_rate: params.expected_doublet_rate,
                verbose: params.verbose,
            },
        );

        let record = ScrubletParamsRecord {
            sim_doublet_ratio: params.sim_doublet_ratio,
            n_neighbors: self.k,
            expected_doublet_rate: params.expected_doublet_rate,
            stdev_doublet_rate: params.stdev_doublet_rate,
            synthetic_doublet_umi_subsampling: params.synthetic_doublet_umi_subsampling,
            dist_metric: params.knn_params.dist_metric.clone(),
            use_approx_neighbours: params.knn_params.use_approx_neighbours,
            seed: params.seed,
        };

        ScrubletResult {
            doublet_scores_obs: self.scores.scores_obs,
            doublet_errors_obs: self.scores.errors_obs,
            doublet_scores_sim: self.scores.scores_sim,
            doublet_errors_sim: self.scores.errors_sim,
            doublet_parents: self.embedded.parents,
            call,
            doublet_neighbour_parents: self.neighbour_parents,
            manifold_obs: self.embedded.manifold_obs,
            manifold_sim: self.embedded.manifold_sim,
            k_adj: self.k_adj,
            params: record,
        }
    }
}

/////////////
// Scoring //
/////////////

/// Calculate the doublet scores
///
/// For each point with `nd` simulated doublets among its `N` neighbours,
/// `q = (nd + 1) / (N + 2)` and the score is the Bayesian estimate
/// `q·ρ/r / (1 − ρ − q·(1 − ρ − ρ/r))` with `r = n_sim / n_obs`.
///
/// ### Params
///
/// * `knn` - Neighbours of all pooled points (observed first).
/// * `n_obs` - Number of observed cells.
/// * `n_sim` - Number of simulated doublets.
/// * `expected_doublet_rate` - Prior doublet rate ρ.
/// * `stdev_doublet_rate` - Standard deviation of the prior.
///
/// ### Returns
///
/// The `DoubletScores`, split into the two populations.
pub fn calculate_doublet_scores(
    knn: &[Vec<usize>],
    n_obs: usize,
    n_sim: usize,
    expected_doublet_rate: f64,
    stdev_doublet_rate: f64,
) -> DoubletScores {
    let r = n_sim as f64 / n_obs as f64;
    let rho = expected_doublet_rate;
    let se_rho = stdev_doublet_rate;

    let scores_errors: Vec<(f64, f64)> = knn
        .par_iter()
        .map(|neighbours| {
            let n_adj = neighbours.len() as f64;
            let nd = neighbours.iter().filter(|&&idx| idx >= n_obs).count() as f64;

            let q = (nd + 1.0) / (n_adj + 2.0);
            let denominator = 1.0 - rho - q * (1.0 - rho - rho / r);
            let score = q * rho / r / denominator;

            let se_q = (q * (1.0 - q) / (n_adj + 3.0)).sqrt();
            let se_score = q * rho / r / (denominator * denominator)
                * ((se_q / q * (1.0 - rho)).powi(2) + (se_rho / rho * (1.0 - q)).powi(2)).sqrt();

            (score, se_score)
        })
        .collect();

    let (scores_obs, errors_obs): (Vec<f64>, Vec<f64>) =
        scores_errors[..n_obs].iter().copied().unzip();
    let (scores_sim, errors_sim): (Vec<f64>, Vec<f64>) =
        scores_errors[n_obs..].iter().copied().unzip();

    DoubletScores {
        scores_obs,
        errors_obs,
        scores_sim,
        errors_sim,
    }
}

/// Parents of the simulated neighbours of each observed cell
///
/// ### Params
///
/// * `knn` - Neighbours of all pooled points (observed first).
/// * `n_obs` - Number of observed cells.
/// * `parents` - Parent pair of each simulated doublet.
///
/// ### Returns
///
/// Per observed cell the sorted, unique parent indices. Empty if the cell
/// has no simulated neighbours.
pub fn doublet_neighbour_parents(
    knn: &[Vec<usize>],
    n_obs: usize,
    parents: &[(usize, usize)],
) -> Vec<Vec<usize>> {
    knn[..n_obs]
        .iter()
        .map(|neighbours| {
            let mut res: Vec<usize> = neighbours
                .iter()
                .filter(|&&idx| idx >= n_obs)
                .flat_map(|&idx| {
                    let (a, b) = parents[idx - n_obs];
                    [a, b]
                })
                .collect();
            res.sort_unstable();
            res.dedup();
            res
        })
        .collect()
}

/////////////
// Calling //
/////////////

/// Find the threshold at the minimum between the two modes of a histogram
///
/// The histogram is smoothed with a running mean of width 3 (reflected at
/// the edges) until at most two local maxima remain. The threshold is the
/// centre of the lowest smoothed bin between them.
///
/// ### Params
///
/// * `scores` - The (simulated doublet) scores. Must not be empty.
/// * `n_bins` - Number of histogram bins.
///
/// ### Returns
///
/// The threshold or `None` if the histogram does not end up with exactly
/// two maxima.
pub fn find_threshold_minimum(scores: &[f64], n_bins: usize) -> Option<f64> {
    if scores.is_empty() || n_bins < 2 || scores.iter().any(|s| !s.is_finite()) {
        return None;
    }

    let (counts, centres) = histogram(scores, n_bins);
    let mut smoothed: Vec<f64> = counts.iter().map(|&c| c as f64).collect();

    let mut maxima = Vec::new();
    let mut last_iter = 0;
    for iter in 0..MAX_SMOOTHING_ITER {
        smoothed = moving_average(&smoothed);
        maxima = local_maxima(&smoothed);
        last_iter = iter;
        if maxima.len() < 3 {
            break;
        }
    }

    if maxima.len() != 2 || last_iter == MAX_SMOOTHING_ITER - 1 {
        return None;
    }

    let (first, second) = (maxima[0], maxima[1]);
    let offset = smoothed[first..=second]
        .iter()
        .enumerate()
        .fold(0, |best, (i, &v)| {
            if v < smoothed[first + best] {
                i
            } else {
                best
            }
        });

    Some(centres[first + offset])
}

/// Running mean of width 3; the values beyond the edges mirror the edge
fn moving_average(data: &[f64]) -> Vec<f64> {
    let n = data.len();
    (0..n)
        .map(|i| {
            let left = if i == 0 { data[0] } else { data[i - 1] };
            let right = if i + 1 == n { data[n - 1] } else { data[i + 1] };
            (left + data[i] + right) / 3.0
        })
        .collect()
}

/// Indices where the histogram turns from rising (or flat) to falling
fn local_maxima(hist: &[f64]) -> Vec<usize> {
    let mut maxima = Vec::new();
    let mut rising = true;
    for i in 0..hist.len().saturating_sub(1) {
        if rising {
            if hist[i + 1] < hist[i] {
                rising = false;
                maxima.push(i);
            }
        } else if hist[i + 1] > hist[i] {
            rising = true;
        }
    }
    maxima
}

/// Parameters of the doublet calling
struct CallParams {
    manual_threshold: Option<f64>,
    n_bins: usize,
    expected_doublet_rate: f64,
    verbose: bool,
}

/// Call the doublets and summarise the rates
fn call_doublets(
    scores_obs: &[f64],
    errors_obs: &[f64],
    scores_sim: &[f64],
    params: CallParams,
) -> DoubletCall {
    let threshold = match params.manual_threshold {
        Some(t) => t,
        None => match find_threshold_minimum(scores_sim, params.n_bins) {
            Some(t) => {
                if params.verbose {
                    info!("Automatically set threshold at doublet score = {:.4}", t);
                }
                t
            }
            None => {
                warn!(
                    "Failed to automatically identify the doublet score threshold; \
                     re-call the doublets with an explicit threshold"
                );
                return DoubletCall::Uncalibrated;
            }
        },
    };

    let predicted_doublets: Vec<bool> = scores_obs.iter().map(|&s| s > threshold).collect();
    let z_scores: Vec<f64> = scores_obs
        .iter()
        .zip(errors_obs)
        .map(|(&s, &e)| (s - threshold) / e)
        .collect();

    let detected_doublet_rate = count_true(&predicted_doublets) as f64 / scores_obs.len() as f64;
    let detectable_doublet_fraction =
        scores_sim.iter().filter(|&&s| s > threshold).count() as f64 / scores_sim.len() as f64;
    let overall_doublet_rate = detected_doublet_rate / detectable_doublet_fraction;

    if detectable_doublet_fraction == 0.0 {
        warn!(
            "No simulated doublet scores above the threshold {:.4}; the overall doublet rate is undefined",
            threshold
        );
    }

    if params.verbose {
        info!(
            "Detected doublet rate = {:.1}%",
            100.0 * detected_doublet_rate
        );
        info!(
            "Estimated detectable doublet fraction = {:.1}%",
            100.0 * detectable_doublet_fraction
        );
        info!(
            "Overall doublet rate: expected = {:.1}%, estimated = {:.1}%",
            100.0 * params.expected_doublet_rate,
            100.0 * overall_doublet_rate
        );
    }

    DoubletCall::Calibrated {
        threshold,
        predicted_doublets,
        z_scores,
        detected_doublet_rate,
        detectable_doublet_fraction,
        overall_doublet_rate,
    }
}

/////////////
// Running //
/////////////

/// Run the full Scrublet pipeline
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes) with their library sizes.
/// * `params` - The Scrublet parameters.
///
/// ### Returns
///
/// The `ScrubletResult`.
pub fn run_scrublet(counts: &CountMatrix, params: &ScrubletParams) -> Result<ScrubletResult> {
    let start_all = Instant::now();

    let res = Scrublet::new(counts.clone(), params.clone())?
        .filter_genes()?
        .simulate_doublets()?
        .embed()?
        .score()?
        .call_doublets();

    if params.verbose {
        info!("Finished Scrublet in {:.2?}", start_all.elapsed());
    }

    Ok(res)
}

/// Run Scrublet independently per batch
///
/// The batches run in parallel and share no state; all of them use the same
/// parameters (and seed). The per cell results are merged back into the
/// original cell order.
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes) with their library sizes.
/// * `batch_labels` - One batch label per cell.
/// * `params` - The Scrublet parameters.
///
/// ### Returns
///
/// The `BatchedScrubletResult`.
pub fn run_scrublet_batched<L>(
    counts: &CountMatrix,
    batch_labels: &[L],
    params: &ScrubletParams,
) -> Result<BatchedScrubletResult>
where
    L: AsRef<str>,
{
    if batch_labels.len() != counts.n_cells() {
        return Err(ScrubletError::param(format!(
            "{} batch labels for {} cells",
            batch_labels.len(),
            counts.n_cells()
        )));
    }
    params.validate()?;

    let mut label_index: FxHashMap<&str, usize> = FxHashMap::default();
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (cell, label) in batch_labels.iter().enumerate() {
        let label = label.as_ref();
        let idx = *label_index.entry(label).or_insert_with(|| {
            groups.push((label.to_string(), Vec::new()));
            groups.len() - 1
        });
        groups[idx].1.push(cell);
    }
    groups.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let results: Vec<ScrubletResult> = groups
        .par_iter()
        .map(|(label, cells)| {
            let batch_counts = counts.select_cells(cells);
            if params.verbose {
                info!("Running batch '{}' with {} cells", label, cells.len());
            }
            run_scrublet(&batch_counts, params)
        })
        .collect::<Result<Vec<_>>>()?;

    let n_cells = counts.n_cells();
    let mut doublet_scores_obs = vec![f64::NAN; n_cells];
    let mut doublet_errors_obs = vec![f64::NAN; n_cells];
    let mut predicted_doublets = vec![false; n_cells];

    for ((_, cells), res) in groups.iter().zip(&results) {
        let predicted = res.predicted_doublets();
        for (j, &cell) in cells.iter().enumerate() {
            doublet_scores_obs[cell] = res.doublet_scores_obs[j];
            doublet_errors_obs[cell] = res.doublet_errors_obs[j];
            predicted_doublets[cell] = predicted[j];
        }
    }

    let batches = groups
        .into_iter()
        .zip(results)
        .map(|((label, cell_indices), result)| ScrubletBatch {
            label,
            cell_indices,
            result,
        })
        .collect();

    Ok(BatchedScrubletResult {
        doublet_scores_obs,
        doublet_errors_obs,
        predicted_doublets,
        batches,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::sparse_structures::CsrMatrix;
    use rstest::rstest;
    use crate::core::data::synthetic_data::{
        create_celltype_counts, spike_in_doublets, CellTypeConfig,
    };

    fn synthetic_counts(n_cells: usize, n_genes: usize, seed: usize) -> CountMatrix {
        let configs = vec![
            CellTypeConfig::with_markers((0..5).collect()),
            CellTypeConfig::with_markers((5..10).collect()),
            CellTypeConfig::with_markers((10..15).collect()),
        ];
        create_celltype_counts(n_cells, n_genes, &configs, (10, 30), (1, 5), seed)
            .unwrap()
            .0
    }

    fn exact_params() -> ScrubletParams {
        ScrubletParams {
            knn_params: KnnParams {
                use_approx_neighbours: false,
                ..KnnParams::default()
            },
            ..ScrubletParams::default()
        }
    }

    #[test]
    fn test_end_to_end_shapes() {
        let counts = synthetic_counts(200, 50, 42);
        let res = run_scrublet(&counts, &ScrubletParams::default()).unwrap();

        assert_eq!(res.doublet_parents.len(), 400);
        assert!(res.doublet_parents.iter().all(|&(i, j)| i < 200 && j < 200));
        assert_eq!(res.doublet_scores_sim.len(), 400);
        assert_eq!(res.doublet_errors_sim.len(), 400);
        assert_eq!(res.doublet_scores_obs.len(), 200);
        assert_eq!(res.manifold_obs.nrows(), 200);
        assert_eq!(res.manifold_sim.nrows(), 400);
        assert_eq!(res.manifold_obs.ncols(), res.manifold_sim.ncols());
        assert_eq!(res.params.n_neighbors, 7);
        assert_eq!(res.k_adj, (7.0_f64 * 3.0).round() as usize);
        assert!(res.k_adj >= res.params.n_neighbors);
        assert!(res.doublet_neighbour_parents.is_none());

        let predicted = res.predicted_doublets();
        match &res.call {
            DoubletCall::Calibrated { threshold, .. } => {
                for (p, s) in predicted.iter().zip(&res.doublet_scores_obs) {
                    assert_eq!(*p, s > threshold);
                }
            }
            DoubletCall::Uncalibrated => {
                assert!(predicted.iter().all(|p| !p));
                assert!(res.threshold().is_none());
            }
        }
    }

    #[rstest]
    #[case::zscore(true, true, false, 1.0)]
    #[case::center_only_thinned(true, false, true, 0.5)]
    #[case::scale_only(false, true, false, 1.0)]
    #[case::raw_log(false, false, true, 1.0)]
    #[case::scale_only_log_thinned(false, true, true, 0.3)]
    fn test_preprocessing_variants(
        #[case] mean_center: bool,
        #[case] normalise_variance: bool,
        #[case] log_transform: bool,
        #[case] subsampling: f64,
    ) {
        let counts = synthetic_counts(150, 40, 13);
        let params = ScrubletParams {
            mean_center,
            normalise_variance,
            log_transform,
            synthetic_doublet_umi_subsampling: subsampling,
            ..exact_params()
        };
        let res = run_scrublet(&counts, &params).unwrap();

        assert_eq!(res.doublet_scores_obs.len(), 150);
        assert_eq!(res.doublet_scores_sim.len(), 300);
        assert_eq!(res.manifold_sim.nrows(), 300);
        assert_eq!(res.manifold_obs.ncols(), res.manifold_sim.ncols());
        assert!(res
            .doublet_scores_obs
            .iter()
            .chain(&res.doublet_scores_sim)
            .all(|s| s.is_finite() && *s >= 0.0));

        let predicted = res.predicted_doublets();
        match res.threshold() {
            Some(t) => {
                for (p, s) in predicted.iter().zip(&res.doublet_scores_obs) {
                    assert_eq!(*p, *s > t);
                }
            }
            None => assert!(predicted.iter().all(|p| !p)),
        }

        // PCA projections are centred, truncated SVD ones of non-negative
        // data are not
        let first: Vec<f32> = res.manifold_obs.col(0).iter().copied().collect();
        let mean = first.iter().sum::<f32>() / first.len() as f32;
        let max_abs = first.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
        if mean_center {
            assert!(mean.abs() < 1e-4 * max_abs);
        } else {
            assert!(mean.abs() > 0.05 * max_abs);
        }
    }

    #[test]
    fn test_deterministic_runs() {
        let counts = synthetic_counts(120, 40, 3);

        let a = run_scrublet(&counts, &exact_params()).unwrap();
        let b = run_scrublet(&counts, &exact_params()).unwrap();
        assert_eq!(a.doublet_parents, b.doublet_parents);
        assert_eq!(a.doublet_scores_obs, b.doublet_scores_obs);
        assert_eq!(a.doublet_scores_sim, b.doublet_scores_sim);

        let params = ScrubletParams {
            random_svd: true,
            seed: 9,
            ..ScrubletParams::default()
        };
        let a = run_scrublet(&counts, &params).unwrap();
        let b = run_scrublet(&counts, &params).unwrap();
        assert_eq!(a.doublet_scores_obs, b.doublet_scores_obs);
        assert_eq!(a.call, b.call);
    }

    #[test]
    fn test_spiked_doublets_score_higher() {
        let singlets = synthetic_counts(300, 60, 5);
        let labels: Vec<usize> = (0..300).map(|i| i % 3).collect();
        let spiked = spike_in_doublets(&singlets, &labels, 30, 8).unwrap();

        let res = run_scrublet(&spiked.counts, &exact_params()).unwrap();
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        let singlet_mean = mean(&res.doublet_scores_obs[..300]);
        let doublet_mean = mean(&res.doublet_scores_obs[300..]);
        assert!(doublet_mean > singlet_mean);
    }

    #[test]
    fn test_manual_threshold_and_recall() {
        let counts = synthetic_counts(150, 40, 11);
        let params = ScrubletParams {
            manual_threshold: Some(0.2),
            get_doublet_neighbour_parents: true,
            ..exact_params()
        };
        let res = run_scrublet(&counts, &params).unwrap();

        assert_eq!(res.threshold(), Some(0.2));
        let manual: Vec<bool> = res.doublet_scores_obs.iter().map(|&s| s > 0.2).collect();
        assert_eq!(res.predicted_doublets(), manual);

        let neighbour_parents = res.doublet_neighbour_parents.clone().unwrap();
        assert_eq!(neighbour_parents.len(), 150);
        assert!(neighbour_parents
            .iter()
            .all(|p| p.windows(2).all(|w| w[0] < w[1]) && p.iter().all(|&i| i < 150)));

        let recalled = res.clone().with_threshold(0.05).unwrap();
        let manual: Vec<bool> = recalled
            .doublet_scores_obs
            .iter()
            .map(|&s| s > 0.05)
            .collect();
        assert_eq!(recalled.predicted_doublets(), manual);
        assert_eq!(recalled.threshold(), Some(0.05));

        assert!(matches!(
            res.clone().with_threshold(f64::NAN),
            Err(ScrubletError::Parameter(_))
        ));
        assert!(res.with_threshold(f64::INFINITY).is_err());
    }

    #[test]
    fn test_scores_non_negative_and_monotone() {
        // 10 observed cells, 20 doublets, 6 neighbours each
        let n_obs = 10;
        let n_sim = 20;
        let knn: Vec<Vec<usize>> = (0..n_obs + n_sim)
            .map(|i| {
                let nd = i % 7;
                let mut row: Vec<usize> = (0..6 - nd).map(|j| (i + j + 1) % n_obs).collect();
                row.extend((0..nd).map(|j| n_obs + j));
                row
            })
            .collect();

        let scores = calculate_doublet_scores(&knn, n_obs, n_sim, 0.1, 0.02);
        assert_eq!(scores.scores_obs.len(), 10);
        assert_eq!(scores.scores_sim.len(), 20);

        let mut by_nd: Vec<(usize, f64)> = (0..n_obs)
            .map(|i| (i % 7, scores.scores_obs[i]))
            .collect();
        by_nd.sort_by_key(|&(nd, _)| nd);
        assert!(by_nd.iter().all(|&(_, s)| s >= 0.0));
        assert!(by_nd.windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(scores.errors_obs.iter().all(|&e| e > 0.0));

        // nd = 0, N = 6, r = 2, rho = 0.1
        let q = 1.0 / 8.0;
        let expected = q * 0.1 / 2.0 / (1.0 - 0.1 - q * (1.0 - 0.1 - 0.05));
        assert!((scores.scores_obs[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_doublet_neighbour_parents() {
        // cells 0 to 2 are observed, 3 and 4 simulated
        let knn = vec![
            vec![1, 3, 4],
            vec![0, 2],
            vec![3, 0],
            vec![2, 0],
            vec![3, 1],
        ];
        let parents = vec![(2, 0), (1, 1)];
        let res = doublet_neighbour_parents(&knn, 3, &parents);
        assert_eq!(res, vec![vec![0, 1, 2], vec![], vec![0, 2]]);
    }

    #[test]
    fn test_threshold_minimum_bimodal() {
        let mut scores: Vec<f64> = (0..500).map(|i| 0.1 + 0.05 * ((i % 50) as f64 / 50.0)).collect();
        scores.extend((0..300).map(|i| 0.7 + 0.1 * ((i % 30) as f64 / 30.0)));
        let t = find_threshold_minimum(&scores, 256).unwrap();
        assert!(t > 0.15 && t < 0.7, "threshold {t}");
    }

    #[test]
    fn test_threshold_minimum_fails_without_two_modes() {
        assert!(find_threshold_minimum(&[0.3; 100], 256).is_none());
        // triangular distribution on [0, 1] with the mode at 0.5
        let n = 100_000;
        let unimodal: Vec<f64> = (0..n)
            .map(|i| {
                let u = (i as f64 + 0.5) / n as f64;
                if u < 0.5 {
                    (u / 2.0).sqrt()
                } else {
                    1.0 - ((1.0 - u) / 2.0).sqrt()
                }
            })
            .collect();
        assert!(find_threshold_minimum(&unimodal, 256).is_none());
        assert!(find_threshold_minimum(&[], 256).is_none());
    }

    #[test]
    fn test_uncalibrated_call() {
        let call = call_doublets(
            &[0.1, 0.5],
            &[0.01, 0.01],
            &[0.2; 10],
            CallParams {
                manual_threshold: None,
                n_bins: 256,
                expected_doublet_rate: 0.05,
                verbose: false,
            },
        );
        assert_eq!(call, DoubletCall::Uncalibrated);
        assert!(call.threshold().is_none());
        assert!(!call.is_calibrated());
    }

    #[test]
    fn test_calibrated_call_rates() {
        let call = call_doublets(
            &[0.1, 0.5, 0.6, 0.05],
            &[0.1, 0.1, 0.1, 0.1],
            &[0.2, 0.4, 0.7, 0.9],
            CallParams {
                manual_threshold: Some(0.45),
                n_bins: 256,
                expected_doublet_rate: 0.05,
                verbose: true,
            },
        );
        match call {
            DoubletCall::Calibrated {
                predicted_doublets,
                z_scores,
                detected_doublet_rate,
                detectable_doublet_fraction,
                overall_doublet_rate,
                ..
            } => {
                assert_eq!(predicted_doublets, vec![false, true, true, false]);
                assert!((z_scores[1] - 0.5).abs() < 1e-12);
                assert!((detected_doublet_rate - 0.5).abs() < 1e-12);
                assert!((detectable_doublet_fraction - 0.5).abs() < 1e-12);
                assert!((overall_doublet_rate - 1.0).abs() < 1e-12);
            }
            DoubletCall::Uncalibrated => panic!("manual threshold must calibrate"),
        }
    }

    #[test]
    fn test_degenerate_rate_is_reported() {
        let call = call_doublets(
            &[0.1, 0.5],
            &[0.1, 0.1],
            &[0.2, 0.3],
            CallParams {
                manual_threshold: Some(0.4),
                n_bins: 256,
                expected_doublet_rate: 0.05,
                verbose: false,
            },
        );
        match call {
            DoubletCall::Calibrated {
                overall_doublet_rate,
                detectable_doublet_fraction,
                ..
            } => {
                assert_eq!(detectable_doublet_fraction, 0.0);
                assert!(overall_doublet_rate.is_infinite());
            }
            DoubletCall::Uncalibrated => panic!("manual threshold must calibrate"),
        }
    }

    #[test]
    fn test_gene_filter_drops_unexpressed_gene() {
        let rows: Vec<Vec<u32>> = (0..30).map(|i| vec![5 + (i % 7) as u32, 0]).collect();
        let csr = CsrMatrix::from_dense_rows(&rows).unwrap();
        let totals: Vec<usize> = (0..30).map(|i| 100 + 10 * (i % 4)).collect();
        let counts = CountMatrix::with_totals(csr, totals).unwrap();

        let filtered = Scrublet::new(counts, ScrubletParams::default())
            .unwrap()
            .filter_genes()
            .unwrap();
        assert_eq!(filtered.gene_filter().indices(), &[0]);

        let simulated = filtered.simulate_doublets().unwrap();
        assert_eq!(simulated.simulated().counts.n_genes(), 1);
        assert_eq!(simulated.simulated().len(), 60);
    }

    #[test]
    fn test_from_manifold() {
        let obs = Mat::from_fn(20, 3, |i, j| ((i * 3 + j) as f32 * 0.37).sin());
        let sim = Mat::from_fn(40, 3, |i, j| ((i * 5 + j) as f32 * 0.11).cos());
        let parents: Vec<(usize, usize)> = (0..40).map(|i| (i % 20, (i * 7) % 20)).collect();

        let bad = Embedded::from_manifold(
            obs.clone(),
            Mat::zeros(40, 2),
            parents.clone(),
            exact_params(),
        );
        assert!(matches!(bad, Err(ScrubletError::Dimension(_))));

        let scored = Embedded::from_manifold(obs, sim, parents, exact_params())
            .unwrap()
            .score()
            .unwrap();
        // default k = round(0.5 * sqrt(20)) = 2, r = 2
        assert_eq!(scored.k_adj(), 6);
        assert_eq!(scored.scores().scores_obs.len(), 20);
        let res = scored.call_doublets();
        assert_eq!(res.doublet_parents.len(), 40);
    }

    #[test]
    fn test_invalid_configuration() {
        let counts = synthetic_counts(30, 20, 1);
        let bad_ratio = ScrubletParams {
            sim_doublet_ratio: 0.0,
            ..ScrubletParams::default()
        };
        assert!(matches!(
            run_scrublet(&counts, &bad_ratio),
            Err(ScrubletError::Parameter(_))
        ));

        let bad_rate = ScrubletParams {
            expected_doublet_rate: 1.5,
            ..ScrubletParams::default()
        };
        assert!(run_scrublet(&counts, &bad_rate).is_err());

        let bad_metric = ScrubletParams {
            knn_params: KnnParams {
                dist_metric: "chebyshev".to_string(),
                use_approx_neighbours: true,
                ..KnnParams::default()
            },
            ..ScrubletParams::default()
        };
        assert!(matches!(
            run_scrublet(&counts, &bad_metric),
            Err(ScrubletError::UnsupportedMetric { .. })
        ));

        let unknown_metric = ScrubletParams {
            knn_params: KnnParams {
                dist_metric: "hamming".to_string(),
                ..KnnParams::default()
            },
            ..ScrubletParams::default()
        };
        assert!(matches!(
            run_scrublet(&counts, &unknown_metric),
            Err(ScrubletError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_params_record() {
        let counts = synthetic_counts(60, 30, 2);
        let res = run_scrublet(&counts, &exact_params()).unwrap();
        assert_eq!(res.params.dist_metric, "euclidean");
        assert!(!res.params.use_approx_neighbours);
        assert_eq!(res.params.seed, 0);
    }

    #[test]
    fn test_batched_run() {
        let counts = synthetic_counts(180, 40, 21);
        // "b" shows up first; batches come back sorted by label
        let labels: Vec<String> = (0..180)
            .map(|i| if i % 2 == 0 { "b".to_string() } else { "a".to_string() })
            .collect();

        let res = run_scrublet_batched(&counts, &labels, &exact_params()).unwrap();
        assert_eq!(res.doublet_scores_obs.len(), 180);
        assert_eq!(res.predicted_doublets.len(), 180);
        assert_eq!(res.batches.len(), 2);
        assert_eq!(res.batches[0].label, "a");
        assert_eq!(res.batches[1].label, "b");
        assert_eq!(res.batches[0].cell_indices[0], 1);

        for batch in &res.batches {
            assert_eq!(batch.cell_indices.len(), 90);
            assert_eq!(batch.result.doublet_scores_sim.len(), 180);
            for (j, &cell) in batch.cell_indices.iter().enumerate() {
                assert_eq!(
                    res.doublet_scores_obs[cell],
                    batch.result.doublet_scores_obs[j]
                );
            }
        }
        assert!(res.doublet_scores_obs.iter().all(|s| s.is_finite()));

        let second = &res.batches[1];
        let single = run_scrublet(&counts.select_cells(&second.cell_indices), &exact_params()).unwrap();
        assert_eq!(single.doublet_scores_obs, second.result.doublet_scores_obs);
    }

    #[test]
    fn test_batched_label_mismatch() {
        let counts = synthetic_counts(30, 20, 1);
        let labels = vec!["a"; 29];
        assert!(matches!(
            run_scrublet_batched(&counts, &labels, &ScrubletParams::default()),
            Err(ScrubletError::Parameter(_))
        ));
    }
}
