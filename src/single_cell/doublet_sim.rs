use rand::prelude::*;
use rand_distr::Binomial;

use crate::core::data::sparse_structures::{CountMatrix, CsrMatrix};
use crate::error::{Result, ScrubletError};

////////////////
// Structures //
////////////////

/// Simulated doublets
///
/// ### Fields
///
/// * `counts` - Summed (and optionally thinned) counts with their library
///   sizes.
/// * `parents` - Row indices of the two observed cells each doublet was
///   generated from.
#[derive(Clone, Debug)]
pub struct SimulatedDoublets {
    pub counts: CountMatrix,
    pub parents: Vec<(usize, usize)>,
}

impl SimulatedDoublets {
    /// Number of simulated doublets
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Were no doublets simulated
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

///////////////
// Functions //
///////////////

/// Simulate doublets by adding the counts of random pairs of observed cells
///
/// Pairs are drawn uniformly with replacement; a cell may be paired with
/// itself. The library size of a doublet is the sum of its parents' library
/// sizes.
///
/// ### Params
///
/// * `counts` - The observed counts.
/// * `sim_doublet_ratio` - Number of doublets to simulate relative to the
///   number of observed cells.
/// * `subsample_rate` - Rate in `(0, 1]` of the binomial thinning of the
///   doublet counts. At 1 no thinning happens.
/// * `seed` - Seed for reproducibility.
///
/// ### Returns
///
/// The `SimulatedDoublets` with `floor(n_obs * sim_doublet_ratio)` cells.
pub fn simulate_doublets(
    counts: &CountMatrix,
    sim_doublet_ratio: f64,
    subsample_rate: f64,
    seed: u64,
) -> Result<SimulatedDoublets> {
    let n_obs = counts.n_cells();
    if n_obs == 0 {
        return Err(ScrubletError::param("no observed cells to pair"));
    }
    if sim_doublet_ratio.is_nan() || sim_doublet_ratio <= 0.0 {
        return Err(ScrubletError::param(format!(
            "sim_doublet_ratio must be positive, got {}",
            sim_doublet_ratio
        )));
    }
    check_rate(subsample_rate)?;

    let n_sim = (n_obs as f64 * sim_doublet_ratio).floor() as usize;
    if n_sim == 0 {
        return Err(ScrubletError::param(format!(
            "{} cells with a ratio of {} yield no doublets",
            n_obs, sim_doublet_ratio
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let parents: Vec<(usize, usize)> = (0..n_sim)
        .map(|_| {
            let i = rng.random_range(0..n_obs);
            let j = rng.random_range(0..n_obs);
            (i, j)
        })
        .collect();

    let summed = sum_row_pairs(&counts.counts, &parents);
    let total_counts: Vec<usize> = parents
        .iter()
        .map(|&(i, j)| counts.total_counts[i] + counts.total_counts[j])
        .collect();
    let mut doublets = CountMatrix::with_totals(summed, total_counts)?;

    if subsample_rate < 1.0 {
        doublets = subsample_counts(&doublets, subsample_rate, &mut rng)?;
    }

    Ok(SimulatedDoublets {
        counts: doublets,
        parents,
    })
}

/// Binomial thinning of counts
///
/// Every count `c` is replaced by a draw of `Binomial(c, rate)`. The new
/// library size is the thinned row sum plus a thinned draw of the library
/// mass outside the matrix columns (e.g. genes removed by a filter), so that
/// library sizes equal to the row sums stay equal to the row sums.
///
/// ### Params
///
/// * `counts` - The counts to thin.
/// * `rate` - Probability in `(0, 1]` to keep a single count.
/// * `rng` - Random number generator.
///
/// ### Returns
///
/// The thinned counts with the adjusted library sizes.
pub fn subsample_counts(counts: &CountMatrix, rate: f64, rng: &mut StdRng) -> Result<CountMatrix> {
    check_rate(rate)?;

    let mut data = Vec::with_capacity(counts.counts.nnz());
    let mut indices = Vec::with_capacity(counts.counts.nnz());
    let mut indptr = Vec::with_capacity(counts.n_cells() + 1);
    let mut total_counts = Vec::with_capacity(counts.n_cells());
    indptr.push(0_usize);

    for row in 0..counts.n_cells() {
        let (idx, values) = counts.counts.row(row);
        let mut original_sum = 0_usize;
        let mut thinned_sum = 0_usize;

        for (&j, &v) in idx.iter().zip(values) {
            original_sum += v as usize;
            let kept = thin(v as u64, rate, rng)?;
            if kept > 0 {
                indices.push(j);
                data.push(kept as u32);
                thinned_sum += kept as usize;
            }
        }
        indptr.push(data.len());

        let outside = counts.total_counts[row].saturating_sub(original_sum);
        let outside_kept = if outside > 0 {
            thin(outside as u64, rate, rng)? as usize
        } else {
            0
        };
        total_counts.push(thinned_sum + outside_kept);
    }

    let csr = CsrMatrix::new(data, indices, indptr, counts.counts.shape)?;
    CountMatrix::with_totals(csr, total_counts)
}

/// Sum the sparse rows of each pair
fn sum_row_pairs(x: &CsrMatrix<u32>, pairs: &[(usize, usize)]) -> CsrMatrix<u32> {
    let mut data = Vec::new();
    let mut indices = Vec::new();
    let mut indptr = Vec::with_capacity(pairs.len() + 1);
    indptr.push(0_usize);

    for &(i, j) in pairs {
        let (idx_a, val_a) = x.row(i);
        let (idx_b, val_b) = x.row(j);
        let (mut a, mut b) = (0, 0);

        // merge of two sorted index lists
        while a < idx_a.len() || b < idx_b.len() {
            let col_a = idx_a.get(a).copied().unwrap_or(usize::MAX);
            let col_b = idx_b.get(b).copied().unwrap_or(usize::MAX);
            if col_a == col_b {
                indices.push(col_a);
                data.push(val_a[a].saturating_add(val_b[b]));
                a += 1;
                b += 1;
            } else if col_a < col_b {
                indices.push(col_a);
                data.push(val_a[a]);
                a += 1;
            } else {
                indices.push(col_b);
                data.push(val_b[b]);
                b += 1;
            }
        }
        indptr.push(data.len());
    }

    CsrMatrix {
        data,
        indices,
        indptr,
        shape: (pairs.len(), x.ncols()),
    }
}

#[inline]
fn thin(n: u64, rate: f64, rng: &mut StdRng) -> Result<u64> {
    let binom = Binomial::new(n, rate).map_err(|e| ScrubletError::param(e.to_string()))?;
    Ok(binom.sample(rng))
}

fn check_rate(rate: f64) -> Result<()> {
    if rate.is_nan() || rate <= 0.0 || rate > 1.0 {
        return Err(ScrubletError::param(format!(
            "subsampling rate must be in (0, 1], got {}",
            rate
        )));
    }
    Ok(())
}

///////////
// Tests //
///////////
