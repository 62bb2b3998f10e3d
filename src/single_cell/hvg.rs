use log::info;
use rayon::prelude::*;

use crate::core::base::stats::{histogram, nelder_mead_1d, percentile, running_quantile};
use crate::core::data::sparse_structures::{CsrMatrix, GeneFilter};
use crate::error::{Result, ScrubletError};

////////////////
// Structures //
////////////////

/// Structure for the v-score results
///
/// All per gene vectors refer to the genes with a positive mean, listed in
/// `gene_indices`.
///
/// ### Fields
///
/// * `v_scores` - Above-Poisson noise statistic per gene.
/// * `gene_indices` - Column indices of the genes with a positive mean.
/// * `mu_gene` - Mean per gene.
/// * `ff_gene` - Fano factor (variance / mean) per gene.
/// * `cv_eff` - Effective coefficient of variation of the cell sizes.
/// * `cv_input` - Coefficient of variation of the input.
/// * `a` - Fitted noise parameter a.
/// * `b` - Fitted noise parameter b.
#[derive(Clone, Debug)]
pub struct VScoreRes {
    pub v_scores: Vec<f64>,
    pub gene_indices: Vec<usize>,
    pub mu_gene: Vec<f64>,
    pub ff_gene: Vec<f64>,
    pub cv_eff: f64,
    pub cv_input: f64,
    pub a: f64,
    pub b: f64,
}

/// Parameters of the gene filter
///
/// ### Fields
///
/// * `min_counts` - Minimum normalised value to count a cell as expressing.
/// * `min_cells` - Minimum number of expressing cells.
/// * `min_gene_var_pctl` - Percentile of the positive v-scores a gene needs
///   to reach.
#[derive(Clone, Copy, Debug)]
pub struct GeneFilterParams {
    pub min_counts: f32,
    pub min_cells: usize,
    pub min_gene_var_pctl: f64,
}

// fitting constants of the v-score noise model
const N_BINS: usize = 50;
const FIT_PERCENTILE: f64 = 0.1;
const N_HIST_BINS: usize = 200;
const B0: f64 = 0.1;

///////////////
// Functions //
///////////////

/// Calculate the v-scores of the genes
///
/// Fits a noise model `CV² = (1 + a)(1 + b) / μ + b` to the lower envelope
/// of the Fano factor vs. mean relationship and reports for each gene by how
/// much its Fano factor exceeds the model.
///
/// ### Params
///
/// * `x` - Normalised cells x genes matrix.
///
/// ### Returns
///
/// The `VScoreRes` or an error if no gene has a positive mean.
pub fn get_vscores(x: &CsrMatrix<f32>) -> Result<VScoreRes> {
    let n_cells = x.nrows().max(1) as f64;
    let n_genes = x.ncols();

    let mut sums = vec![0.0_f64; n_genes];
    let mut sq_sums = vec![0.0_f64; n_genes];
    for (&j, &v) in x.indices.iter().zip(&x.data) {
        sums[j] += v as f64;
        sq_sums[j] += (v as f64) * (v as f64);
    }

    let gene_indices: Vec<usize> = (0..n_genes).filter(|&j| sums[j] > 0.0).collect();
    if gene_indices.is_empty() {
        return Err(ScrubletError::NoGenesRetained);
    }

    let mu_gene: Vec<f64> = gene_indices.iter().map(|&j| sums[j] / n_cells).collect();
    let ff_gene: Vec<f64> = gene_indices
        .iter()
        .zip(&mu_gene)
        .map(|(&j, &mu)| {
            let var = (sq_sums[j] / n_cells - mu * mu).max(0.0);
            var / mu
        })
        .collect();

    // genes without variance have ln(FF) = -inf and do not inform the fit
    let (data_x, data_y): (Vec<f64>, Vec<f64>) = mu_gene
        .iter()
        .zip(&ff_gene)
        .map(|(&mu, &ff)| (mu.ln(), (ff / mu).ln()))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .unzip();

    let (bin_x, bin_y) = running_quantile(&data_x, &data_y, FIT_PERCENTILE, N_BINS);
    let (fit_x, fit_y): (Vec<f64>, Vec<f64>) = bin_x
        .into_iter()
        .zip(bin_y)
        .filter(|(_, y)| !y.is_nan())
        .unzip();

    let log_ff: Vec<f64> = ff_gene.iter().map(|ff| ff.ln()).filter(|v| v.is_finite()).collect();
    let c = if log_ff.is_empty() {
        1.0
    } else {
        let (counts, centres) = histogram(&log_ff, N_HIST_BINS);
        let max_ix = counts
            .iter()
            .enumerate()
            .fold(0, |best, (i, &n)| if n > counts[best] { i } else { best });
        centres[max_ix].exp().max(1.0)
    };

    let err_fun = |b: f64| -> f64 {
        let err: f64 = fit_x
            .iter()
            .zip(&fit_y)
            .map(|(&x, &y)| ((c * (-x).exp() + b).ln() - y).abs())
            .sum();
        // outside the domain of the log
        if err.is_nan() {
            f64::INFINITY
        } else {
            err
        }
    };
    let b = nelder_mead_1d(err_fun, B0, 1e-4, 1e-4, 200);
    let a = c / (1.0 + b) - 1.0;

    let v_scores: Vec<f64> = ff_gene
        .par_iter()
        .zip(mu_gene.par_iter())
        .map(|(&ff, &mu)| ff / ((1.0 + a) * (1.0 + b) + b * mu))
        .collect();

    Ok(VScoreRes {
        v_scores,
        gene_indices,
        mu_gene,
        ff_gene,
        cv_eff: ((1.0 + a) * (1.0 + b) - 1.0).sqrt(),
        cv_input: b.sqrt(),
        a,
        b,
    })
}

/// Select the genes that are expressed and highly variable
///
/// A gene is kept if it has a positive v-score, at least `min_cells` cells
/// with a value ≥ `min_counts`, and a v-score at or above the
/// `min_gene_var_pctl` percentile of all positive v-scores.
///
/// ### Params
///
/// * `x` - Normalised (observed) cells x genes matrix.
/// * `params` - The gene filter parameters.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `GeneFilter` or an error if no gene is retained.
pub fn get_gene_filter(
    x: &CsrMatrix<f32>,
    params: &GeneFilterParams,
    verbose: bool,
) -> Result<GeneFilter> {
    let vscores = get_vscores(x)?;

    let (positive_genes, positive_v): (Vec<usize>, Vec<f64>) = vscores
        .gene_indices
        .iter()
        .zip(&vscores.v_scores)
        .filter(|(_, &v)| v > 0.0)
        .map(|(&j, &v)| (j, v))
        .unzip();

    let min_vscore =
        percentile(&positive_v, params.min_gene_var_pctl).ok_or(ScrubletError::NoGenesRetained)?;

    let mut expressing_cells = vec![0_usize; x.ncols()];
    for (&j, &v) in x.indices.iter().zip(&x.data) {
        if v >= params.min_counts {
            expressing_cells[j] += 1;
        }
    }
    // a cell without an entry has a value of 0
    if params.min_counts <= 0.0 {
        let mut nnz = vec![0_usize; x.ncols()];
        x.indices.iter().for_each(|&j| nnz[j] += 1);
        for (e, n) in expressing_cells.iter_mut().zip(nnz) {
            *e += x.nrows() - n;
        }
    }

    let kept: Vec<usize> = positive_genes
        .iter()
        .zip(&positive_v)
        .filter(|(&j, &v)| expressing_cells[j] >= params.min_cells && v >= min_vscore)
        .map(|(&j, _)| j)
        .collect();

    if verbose {
        info!(
            "v-score fit: a = {:.3}, b = {:.3}, CV_eff = {:.3}, CV_input = {:.3}; kept {} of {} genes",
            vscores.a,
            vscores.b,
            vscores.cv_eff,
            vscores.cv_input,
            kept.len(),
            x.ncols()
        );
    }

    if kept.is_empty() {
        return Err(ScrubletError::NoGenesRetained);
    }

    GeneFilter::new(kept, x.ncols())
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{create_celltype_counts, CellTypeConfig};
    use crate::single_cell::processing::{median_total, normalise_total};

    fn dense_to_csr(rows: &[Vec<f32>]) -> CsrMatrix<f32> {
        CsrMatrix::from_dense_rows(rows).unwrap()
    }

    fn default_params() -> GeneFilterParams {
        GeneFilterParams {
            min_counts: 3.0,
            min_cells: 3,
            min_gene_var_pctl: 85.0,
        }
    }

    fn synthetic_normalised() -> CsrMatrix<f32> {
        let configs = vec![
            CellTypeConfig::with_markers((0..5).collect()),
            CellTypeConfig::with_markers((5..10).collect()),
            CellTypeConfig::with_markers((10..15).collect()),
        ];
        let (counts, _) =
            create_celltype_counts(150, 60, &configs, (10, 30), (1, 5), 42).unwrap();
        normalise_total(&counts, median_total(&counts))
    }

    #[test]
    fn test_all_zero_gene_is_excluded() {
        let x = dense_to_csr(&[
            vec![0.0, 0.0],
            vec![5.0, 0.0],
            vec![10.0, 0.0],
            vec![4.0, 0.0],
            vec![20.0, 0.0],
        ]);
        let vscores = get_vscores(&x).unwrap();
        assert_eq!(vscores.gene_indices, vec![0]);

        let filter = get_gene_filter(&x, &default_params(), false).unwrap();
        assert_eq!(filter.indices(), &[0]);
    }

    #[test]
    fn test_constant_gene_has_zero_vscore() {
        let x = dense_to_csr(&[
            vec![2.0, 3.0, 4.0],
            vec![2.0, 8.0, 4.0],
            vec![2.0, 1.0, 4.0],
            vec![2.0, 12.0, 4.0],
        ]);
        let vscores = get_vscores(&x).unwrap();
        assert_eq!(vscores.gene_indices, vec![0, 1, 2]);
        assert_eq!(vscores.v_scores[0], 0.0);
        assert_eq!(vscores.v_scores[2], 0.0);
        assert!(vscores.v_scores[1] > 0.0);

        let filter = get_gene_filter(&x, &default_params(), false).unwrap();
        assert_eq!(filter.indices(), &[1]);
    }

    #[test]
    fn test_vscore_model_consistency() {
        let x = synthetic_normalised();
        let res = get_vscores(&x).unwrap();
        assert_eq!(res.v_scores.len(), res.gene_indices.len());
        assert_eq!(res.mu_gene.len(), res.gene_indices.len());
        assert!(res.mu_gene.iter().all(|&m| m > 0.0));
        let c = (1.0 + res.a) * (1.0 + res.b);
        assert!(c >= 1.0 - 1e-9);
        assert!((res.cv_eff - (c - 1.0).max(0.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_gene_filter_on_synthetic_counts() {
        let x = synthetic_normalised();
        let filter = get_gene_filter(&x, &default_params(), false).unwrap();
        assert!(!filter.is_empty());
        // at most the top 15 % plus ties
        assert!(filter.len() <= 60);
        assert!(filter.indices().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_gene_filter_min_cells() {
        let x = dense_to_csr(&[vec![0.0, 1.0], vec![5.0, 0.0], vec![0.0, 9.0], vec![0.0, 3.0]]);
        let params = GeneFilterParams {
            min_counts: 3.0,
            min_cells: 2,
            min_gene_var_pctl: 0.0,
        };
        let filter = get_gene_filter(&x, &params, false).unwrap();
        // gene 0 is only expressed in one cell
        assert_eq!(filter.indices(), &[1]);
    }

    #[test]
    fn test_no_expressed_genes() {
        let x = dense_to_csr(&[vec![0.0, 0.0], vec![0.0, 0.0]]);
        assert!(matches!(
            get_gene_filter(&x, &default_params(), false),
            Err(ScrubletError::NoGenesRetained)
        ));
    }
}
