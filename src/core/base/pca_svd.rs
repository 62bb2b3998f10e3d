use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::Normal;

use crate::error::{Result, ScrubletError};

////////////////
// Structures //
////////////////

/// Structure for random SVD results
///
/// ### Fields
///
/// * `u` - Matrix u of the SVD decomposition
/// * `v` - Matrix v of the SVD decomposition
/// * `s` - Singular values of the SVD decomposition
#[derive(Clone, Debug)]
pub struct RandomSvdResults<T> {
    pub u: faer::Mat<T>,
    pub v: faer::Mat<T>,
    pub s: Vec<T>,
}

/// Which SVD solver to use for fitting a linear embedding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SvdSolver {
    /// Full thin SVD
    Exact,
    /// Randomised SVD with a fixed seed
    Randomised { seed: u64 },
}

/// A fitted linear projection into a low dimensional space
///
/// ### Fields
///
/// * `means` - Column means subtracted before projecting. `None` for
///   uncentered (truncated SVD) projections.
/// * `loadings` - The loadings with shape `features x components`.
#[derive(Clone, Debug)]
pub struct LinearProjection {
    pub means: Option<Vec<f32>>,
    pub loadings: Mat<f32>,
}

impl LinearProjection {
    /// Number of components of the projection
    pub fn n_components(&self) -> usize {
        self.loadings.ncols()
    }

    /// Project data with the fitted basis
    ///
    /// ### Params
    ///
    /// * `x` - Matrix of `samples x features`. The features must match the
    ///   ones the projection was fitted on.
    ///
    /// ### Returns
    ///
    /// The embedding of shape `samples x components`.
    pub fn transform(&self, x: MatRef<f32>) -> Result<Mat<f32>> {
        if x.ncols() != self.loadings.nrows() {
            return Err(ScrubletError::Dimension(format!(
                "Projection fitted on {} features, got {}",
                self.loadings.nrows(),
                x.ncols()
            )));
        }

        match &self.means {
            Some(means) => {
                let centred = Mat::from_fn(x.nrows(), x.ncols(), |i, j| x[(i, j)] - means[j]);
                Ok(&centred * &self.loadings)
            }
            None => Ok(x * &self.loadings),
        }
    }
}

////////////
// Traits //
////////////

/// Fits a linear low-rank embedding on one population of cells so that it
/// can be applied to others
pub trait ManifoldEmbedder {
    /// Fit the projection
    fn fit(&self, x: MatRef<f32>) -> Result<LinearProjection>;

    /// Fit the projection and return it together with the embedding of `x`
    fn fit_transform(&self, x: MatRef<f32>) -> Result<(LinearProjection, Mat<f32>)> {
        let projection = self.fit(x)?;
        let embedding = projection.transform(x)?;
        Ok((projection, embedding))
    }
}

/// Principal component analysis (centred SVD)
#[derive(Clone, Debug)]
pub struct PcaEmbedder {
    pub n_components: usize,
    pub solver: SvdSolver,
}

/// Truncated SVD without centring
#[derive(Clone, Debug)]
pub struct TruncatedSvdEmbedder {
    pub n_components: usize,
    pub solver: SvdSolver,
}

impl ManifoldEmbedder for PcaEmbedder {
    fn fit(&self, x: MatRef<f32>) -> Result<LinearProjection> {
        let means = col_means(x);
        let centred = Mat::from_fn(x.nrows(), x.ncols(), |i, j| x[(i, j)] - means[j]);
        let loadings = top_right_singular_vectors(centred.as_ref(), self.n_components, self.solver)?;

        Ok(LinearProjection {
            means: Some(means),
            loadings,
        })
    }
}

impl ManifoldEmbedder for TruncatedSvdEmbedder {
    fn fit(&self, x: MatRef<f32>) -> Result<LinearProjection> {
        let loadings = top_right_singular_vectors(x, self.n_components, self.solver)?;

        Ok(LinearProjection {
            means: None,
            loadings,
        })
    }
}

///////////////
// Functions //
///////////////

/// Randomised SVD (f32)
///
/// ### Params
///
/// * `x` - The matrix on which to apply the randomised SVD.
/// * `rank` - The target rank of the approximation (number of singular values,
///   vectors to compute).
/// * `seed` - Random seed for reproducible results.
/// * `oversampling` - Additional samples beyond the target rank to improve accuracy.
///   Defaults to 10 if not specified.
/// * `n_power_iter` - Number of power iterations to perform for better approximation quality.
///   More iterations generally improve accuracy but increase computation time.
///   Defaults to 2 if not specified.
///
/// ### Returns
///
/// The randomised SVD results in form of `RandomSvdResults`.
///
/// ### Algorithm Details
///
/// 1. Generate a random Gaussian matrix Ω of size n × (rank + oversampling)
/// 2. Compute Y = X * Ω to capture the range of X
/// 3. Orthogonalize Y using QR decomposition to get Q
/// 4. Apply power iterations: for each iteration, compute Z = X^T * Q, then Q = QR(X * Z)
/// 5. Form B = Q^T * X and compute its SVD
/// 6. Reconstruct the final SVD: U = Q * U_B, V = V_B, S = S_B
pub fn randomised_svd_f32(
    x: MatRef<f32>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> Result<RandomSvdResults<f32>> {
    let ncol = x.ncols();
    let nrow = x.nrows();

    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);

    let mut rng = StdRng::seed_from_u64(seed);
    let normal =
        Normal::new(0.0_f64, 1.0).map_err(|e| ScrubletError::Decomposition(e.to_string()))?;
    let omega = Mat::from_fn(ncol, sample_size, |_, _| normal.sample(&mut rng) as f32);

    let y = x * omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * &q;
        q = (x * z).qr().compute_thin_Q();
    }

    let b = q.transpose() * x;
    let svd = b
        .thin_svd()
        .map_err(|e| ScrubletError::Decomposition(format!("{e:?}")))?;

    Ok(RandomSvdResults {
        u: &q * svd.U(),
        v: svd.V().to_owned(),
        s: svd.S().column_vector().iter().copied().collect(),
    })
}

/// Column means of a matrix
fn col_means(x: MatRef<f32>) -> Vec<f32> {
    let n = x.nrows().max(1) as f32;
    (0..x.ncols())
        .map(|j| x.col(j).iter().sum::<f32>() / n)
        .collect()
}

/// Get the first `n_components` right singular vectors as a loading matrix
fn top_right_singular_vectors(
    x: MatRef<f32>,
    n_components: usize,
    solver: SvdSolver,
) -> Result<Mat<f32>> {
    let max_rank = x.nrows().min(x.ncols());
    if n_components == 0 || n_components > max_rank {
        return Err(ScrubletError::param(format!(
            "Number of components must be in [1, {}], got {}",
            max_rank, n_components
        )));
    }

    let n_features = x.ncols();
    let loadings = match solver {
        SvdSolver::Exact => {
            let res = x
                .thin_svd()
                .map_err(|e| ScrubletError::Decomposition(format!("{e:?}")))?;
            res.V().submatrix(0, 0, n_features, n_components).to_owned()
        }
        SvdSolver::Randomised { seed } => {
            let res = randomised_svd_f32(x, n_components, seed, Some(100_usize), None)?;
            res.v.submatrix(0, 0, n_features, n_components).to_owned()
        }
    };

    Ok(loadings)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    /// 40 x 6 matrix of rank two plus an offset
    fn low_rank_data() -> Mat<f32> {
        Mat::from_fn(40, 6, |i, j| {
            let a = (i as f32 * 0.37).sin();
            let b = (i as f32 * 0.11).cos();
            5.0 + a * (j as f32 + 1.0) + b * (6.0 - j as f32)
        })
    }

    fn column_variance(x: MatRef<f32>, j: usize) -> f32 {
        let n = x.nrows() as f32;
        let mean = x.col(j).iter().sum::<f32>() / n;
        x.col(j).iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
    }

    #[test]
    fn test_pca_scores_are_centred_and_ordered() {
        let x = low_rank_data();
        let pca = PcaEmbedder {
            n_components: 3,
            solver: SvdSolver::Exact,
        };
        let (proj, scores) = pca.fit_transform(x.as_ref()).unwrap();

        assert_eq!(proj.n_components(), 3);
        assert_eq!(scores.nrows(), 40);
        assert_eq!(scores.ncols(), 3);

        for j in 0..3 {
            let mean = scores.col(j).iter().sum::<f32>() / 40.0;
            assert!(mean.abs() < 1e-3);
        }
        let v0 = column_variance(scores.as_ref(), 0);
        let v1 = column_variance(scores.as_ref(), 1);
        let v2 = column_variance(scores.as_ref(), 2);
        assert!(v0 >= v1);
        // rank two data
        assert!(v2 < 1e-3);
    }

    #[test]
    fn test_truncated_svd_has_no_means() {
        let x = low_rank_data();
        let tsvd = TruncatedSvdEmbedder {
            n_components: 2,
            solver: SvdSolver::Exact,
        };
        let proj = tsvd.fit(x.as_ref()).unwrap();
        assert!(proj.means.is_none());
        assert_eq!(proj.loadings.nrows(), 6);
        assert_eq!(proj.loadings.ncols(), 2);
    }

    #[test]
    fn test_randomised_matches_exact_variance() {
        let x = low_rank_data();
        let exact = PcaEmbedder {
            n_components: 2,
            solver: SvdSolver::Exact,
        };
        let random = PcaEmbedder {
            n_components: 2,
            solver: SvdSolver::Randomised { seed: 42 },
        };
        let (_, s_exact) = exact.fit_transform(x.as_ref()).unwrap();
        let (_, s_random) = random.fit_transform(x.as_ref()).unwrap();

        for j in 0..2 {
            let a = column_variance(s_exact.as_ref(), j);
            let b = column_variance(s_random.as_ref(), j);
            assert!((a - b).abs() / a.max(1e-6) < 1e-2);
        }
    }

    #[test]
    fn test_randomised_is_reproducible() {
        let x = low_rank_data();
        let a = randomised_svd_f32(x.as_ref(), 2, 7, None, None).unwrap();
        let b = randomised_svd_f32(x.as_ref(), 2, 7, None, None).unwrap();
        assert_eq!(a.s, b.s);
    }

    #[test]
    fn test_transform_dimension_mismatch() {
        let x = low_rank_data();
        let pca = PcaEmbedder {
            n_components: 2,
            solver: SvdSolver::Exact,
        };
        let proj = pca.fit(x.as_ref()).unwrap();
        let other = Mat::<f32>::zeros(3, 5);
        assert!(matches!(
            proj.transform(other.as_ref()),
            Err(ScrubletError::Dimension(_))
        ));
    }

    #[test]
    fn test_too_many_components() {
        let x = Mat::<f32>::zeros(3, 5);
        let pca = PcaEmbedder {
            n_components: 4,
            solver: SvdSolver::Exact,
        };
        assert!(pca.fit(x.as_ref()).is_err());
    }
}
