use faer::Mat;

use crate::core::base::stats::median;
use crate::core::data::sparse_structures::{CountMatrix, CsrMatrix};
use crate::error::{Result, ScrubletError};

///////////
// Enums //
///////////

/// How genes are centred and scaled before the embedding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingMode {
    /// Subtract the mean and divide by the standard deviation
    ZScore,
    /// Subtract the mean only
    CenterOnly,
    /// Divide by the standard deviation only
    ScaleOnly,
    /// Leave the values as they are
    None,
}

impl ScalingMode {
    /// Get the scaling mode from the two toggles
    pub fn from_flags(mean_center: bool, normalise_variance: bool) -> Self {
        match (mean_center, normalise_variance) {
            (true, true) => ScalingMode::ZScore,
            (true, false) => ScalingMode::CenterOnly,
            (false, true) => ScalingMode::ScaleOnly,
            (false, false) => ScalingMode::None,
        }
    }

    /// Is the mean subtracted
    pub fn centres(&self) -> bool {
        matches!(self, ScalingMode::ZScore | ScalingMode::CenterOnly)
    }
}

///////////////////
// Normalisation //
///////////////////

/// Median of the library sizes
///
/// ### Params
///
/// * `counts` - The count matrix.
///
/// ### Returns
///
/// The median total count (0 for an empty matrix).
pub fn median_total(counts: &CountMatrix) -> f32 {
    let totals: Vec<f64> = counts.total_counts.iter().map(|&t| t as f64).collect();
    median(&totals).unwrap_or(0.0) as f32
}

/// Total count normalisation
///
/// Each count is scaled by `target / library size` of its cell. Cells with
/// a library size of 0 stay all-zero.
///
/// ### Params
///
/// * `counts` - The raw counts with their library sizes.
/// * `target` - The target library size.
///
/// ### Returns
///
/// The normalised values with the sparsity pattern of the counts.
pub fn normalise_total(counts: &CountMatrix, target: f32) -> CsrMatrix<f32> {
    let factors: Vec<f64> = counts
        .total_counts
        .iter()
        .map(|&total| {
            if total > 0 {
                target as f64 / total as f64
            } else {
                0.0
            }
        })
        .collect();

    counts
        .counts
        .map_values(|row, v| (v as f64 * factors[row]) as f32)
}

/// Natural log transform `ln(1 + x)` of every stored value
pub fn log_transform(x: &CsrMatrix<f32>) -> CsrMatrix<f32> {
    x.map_values(|_, v| v.ln_1p())
}

/////////////
// Scaling //
/////////////

/// Per gene centring and scaling with statistics from a reference population
///
/// ### Fields
///
/// * `means` - Mean per gene.
/// * `stds` - Population standard deviation per gene. Zero standard
///   deviations are stored as 1.
/// * `mode` - Which operations to apply.
#[derive(Clone, Debug)]
pub struct GeneScaler {
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
    pub mode: ScalingMode,
}

impl GeneScaler {
    /// Fit the per gene statistics
    ///
    /// ### Params
    ///
    /// * `x` - The reference (observed) cells x genes matrix.
    /// * `mode` - Scaling mode to apply later.
    ///
    /// ### Returns
    ///
    /// The fitted scaler
    pub fn fit(x: &CsrMatrix<f32>, mode: ScalingMode) -> Self {
        let n_genes = x.ncols();
        let n = x.nrows().max(1) as f64;

        let mut sums = vec![0.0_f64; n_genes];
        let mut sq_sums = vec![0.0_f64; n_genes];
        for (&j, &v) in x.indices.iter().zip(&x.data) {
            sums[j] += v as f64;
            sq_sums[j] += (v as f64) * (v as f64);
        }

        let (means, stds): (Vec<f32>, Vec<f32>) = sums
            .iter()
            .zip(&sq_sums)
            .map(|(&s, &sq)| {
                let mean = s / n;
                let var = (sq / n - mean * mean).max(0.0);
                let std = var.sqrt();
                (mean as f32, if std > 0.0 { std as f32 } else { 1.0 })
            })
            .unzip();

        Self { means, stds, mode }
    }

    /// Apply the scaling
    ///
    /// ### Params
    ///
    /// * `x` - A cells x genes matrix with the genes of the reference.
    ///
    /// ### Returns
    ///
    /// The dense, scaled matrix.
    pub fn transform(&self, x: &CsrMatrix<f32>) -> Result<Mat<f32>> {
        if x.ncols() != self.means.len() {
            return Err(ScrubletError::Dimension(format!(
                "Scaler fitted on {} genes, got {}",
                self.means.len(),
                x.ncols()
            )));
        }

        let mut dense = x.to_dense();
        let (center, scale) = match self.mode {
            ScalingMode::ZScore => (true, true),
            ScalingMode::CenterOnly => (true, false),
            ScalingMode::ScaleOnly => (false, true),
            ScalingMode::None => return Ok(dense),
        };

        for j in 0..dense.ncols() {
            let mean = if center { self.means[j] } else { 0.0 };
            let std = if scale { self.stds[j] } else { 1.0 };
            for i in 0..dense.nrows() {
                dense[(i, j)] = (dense[(i, j)] - mean) / std;
            }
        }

        Ok(dense)
    }
}

///////////
// Tests //
///////////
