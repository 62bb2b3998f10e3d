use std::ops::{Add, Div};

use crate::utils::general::array_max_min;

/////////////////
// Descriptive //
/////////////////

/// Get the median
///
/// ### Params
///
/// * `x` - The slice for which to calculate the median for.
///
/// ### Results
///
/// The median (if the vector is not empty)
pub fn median<T>(x: &[T]) -> Option<T>
where
    T: Clone + PartialOrd + Add<Output = T> + Div<T, Output = T> + From<u8>,
{
    if x.is_empty() {
        return None;
    }

    let mut data = x.to_vec();
    let len = data.len();
    let cmp = |a: &T, b: &T| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal);

    if len % 2 == 0 {
        let (_, median1, right) = data.select_nth_unstable_by(len / 2 - 1, cmp);
        let median2 = right.iter().min_by(|a, b| cmp(a, b))?;
        Some((median1.clone() + median2.clone()) / T::from(2))
    } else {
        let (_, median, _) = data.select_nth_unstable_by(len / 2, cmp);
        Some(median.clone())
    }
}

/// Percentile with linear interpolation between the closest ranks
///
/// ### Params
///
/// * `x` - The values.
/// * `q` - Percentile in `[0, 100]`.
///
/// ### Returns
///
/// The percentile (if the vector is not empty)
pub fn percentile(x: &[f64], q: f64) -> Option<f64> {
    if x.is_empty() {
        return None;
    }
    let mut sorted = x.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));

    let pos = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Running percentile of `y` over equally spaced bins of `x`
///
/// Bins without observations inherit the value of the previous bin. A
/// leading empty bin yields `NaN`, which the caller is expected to drop.
///
/// ### Params
///
/// * `x` - The values defining the bins.
/// * `y` - The values from which to take the percentile per bin.
/// * `q` - Percentile in `[0, 100]`.
/// * `n_bins` - Number of bins.
///
/// ### Returns
///
/// Tuple of `(bin centres, percentile per bin)`
pub fn running_quantile(x: &[f64], y: &[f64], q: f64, n_bins: usize) -> (Vec<f64>, Vec<f64>) {
    crate::assert_same_len!(x, y);
    if x.is_empty() || n_bins == 0 {
        return (Vec::new(), Vec::new());
    }

    let mut order: Vec<usize> = (0..x.len()).collect();
    order.sort_unstable_by(|&a, &b| x[a].total_cmp(&x[b]));
    let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();

    let (x_min, x_max) = (xs[0], xs[xs.len() - 1]);
    let dx = (x_max - x_min) / n_bins as f64;

    // all x identical: a single bin covering everything
    if dx <= 0.0 {
        return (vec![x_min], vec![percentile(&ys, q).unwrap_or(f64::NAN)]);
    }

    let centres: Vec<f64> = if n_bins == 1 {
        vec![x_min + dx / 2.0]
    } else {
        let first = x_min + dx / 2.0;
        let last = x_max - dx / 2.0;
        let step = (last - first) / (n_bins - 1) as f64;
        (0..n_bins).map(|i| first + step * i as f64).collect()
    };

    let mut out = Vec::with_capacity(n_bins);
    for (i, &c) in centres.iter().enumerate() {
        let in_bin: Vec<f64> = xs
            .iter()
            .zip(&ys)
            .filter(|(&xv, _)| xv >= c - dx / 2.0 && xv < c + dx / 2.0)
            .map(|(_, &yv)| yv)
            .collect();

        let value = match percentile(&in_bin, q) {
            Some(v) => v,
            None if i > 0 => out[i - 1],
            None => f64::NAN,
        };
        out.push(value);
    }

    (centres, out)
}

/// Histogram over equally sized bins spanning the data range
///
/// If all values are identical the range is widened by 0.5 on each side.
///
/// ### Params
///
/// * `x` - The values. Must not be empty.
/// * `n_bins` - Number of bins.
///
/// ### Returns
///
/// Tuple of `(counts per bin, bin centres)`
pub fn histogram(x: &[f64], n_bins: usize) -> (Vec<usize>, Vec<f64>) {
    let (mut lo, mut hi) = array_max_min(x);
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }
    let width = (hi - lo) / n_bins as f64;

    let mut counts = vec![0_usize; n_bins];
    for &v in x {
        let bin = (((v - lo) / width).floor() as usize).min(n_bins - 1);
        counts[bin] += 1;
    }
    let centres = (0..n_bins)
        .map(|i| lo + width * (i as f64 + 0.5))
        .collect();

    (counts, centres)
}

//////////////////
// Optimisation //
//////////////////

/// Minimise a function of one variable with the Nelder-Mead simplex
///
/// ### Params
///
/// * `f` - Function to minimise.
/// * `x0` - Starting point.
/// * `x_tol` - Absolute tolerance on the simplex size.
/// * `f_tol` - Absolute tolerance on the function values in the simplex.
/// * `max_iter` - Maximum number of iterations.
///
/// ### Returns
///
/// The location of the minimum found.
pub fn nelder_mead_1d<F>(f: F, x0: f64, x_tol: f64, f_tol: f64, max_iter: usize) -> f64
where
    F: Fn(f64) -> f64,
{
    let (rho, chi, psi, sigma) = (1.0, 2.0, 0.5, 0.5);

    let x1 = if x0 != 0.0 { 1.05 * x0 } else { 0.00025 };
    let mut sim = [(x0, f(x0)), (x1, f(x1))];
    sim.sort_by(|a, b| a.1.total_cmp(&b.1));

    for _ in 0..max_iter {
        let (best, worst) = (sim[0], sim[1]);
        if (worst.0 - best.0).abs() <= x_tol && (worst.1 - best.1).abs() <= f_tol {
            break;
        }

        // with two vertices the centroid is the best point
        let centroid = best.0;
        let xr = (1.0 + rho) * centroid - rho * worst.0;
        let fr = f(xr);

        if fr < best.1 {
            let xe = (1.0 + rho * chi) * centroid - rho * chi * worst.0;
            let fe = f(xe);
            sim[1] = if fe < fr { (xe, fe) } else { (xr, fr) };
        } else {
            let contracted = if fr < worst.1 {
                // outside contraction
                let xc = (1.0 + psi * rho) * centroid - psi * rho * worst.0;
                let fc = f(xc);
                (fc <= fr).then_some((xc, fc))
            } else {
                // inside contraction
                let xcc = (1.0 - psi) * centroid + psi * worst.0;
                let fcc = f(xcc);
                (fcc < worst.1).then_some((xcc, fcc))
            };
            sim[1] = match contracted {
                Some(point) => point,
                None => {
                    let xs = best.0 + sigma * (worst.0 - best.0);
                    (xs, f(xs))
                }
            };
        }
        sim.sort_by(|a, b| a.1.total_cmp(&b.1));
    }

    sim[0].0
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median::<f64>(&[]), None);
    }

    #[test]
    fn test_percentile_interpolates() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&x, 0.0), Some(1.0));
        assert_eq!(percentile(&x, 100.0), Some(5.0));
        assert_eq!(percentile(&x, 50.0), Some(3.0));
        assert!((percentile(&x, 85.0).unwrap() - 4.4).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_running_quantile_fills_empty_bins() {
        let x = [0.0, 0.1, 0.2, 9.8, 9.9, 10.0];
        let y = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let (centres, q) = running_quantile(&x, &y, 0.0, 5);
        assert_eq!(centres.len(), 5);
        assert_eq!(q[0], 1.0);
        // middle bins are empty and inherit the first bin
        assert_eq!(q[1], 1.0);
        assert_eq!(q[3], 1.0);
    }

    #[test]
    fn test_running_quantile_constant_x() {
        let (centres, q) = running_quantile(&[2.0, 2.0], &[1.0, 3.0], 50.0, 10);
        assert_eq!(centres, vec![2.0]);
        assert_eq!(q, vec![2.0]);
    }

    #[test]
    fn test_histogram() {
        let (counts, centres) = histogram(&[0.0, 0.1, 0.9, 1.0], 2);
        assert_eq!(counts, vec![2, 2]);
        assert!((centres[0] - 0.25).abs() < 1e-12);
        assert!((centres[1] - 0.75).abs() < 1e-12);

        let (counts, centres) = histogram(&[3.0, 3.0], 4);
        assert_eq!(counts.iter().sum::<usize>(), 2);
        assert!(centres[0] > 2.5 && centres[3] < 3.5);
    }

    #[test]
    fn test_nelder_mead_quadratic() {
        let x = nelder_mead_1d(|x| (x - 3.0).powi(2), 0.1, 1e-6, 1e-10, 500);
        assert!((x - 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_nelder_mead_absolute_loss() {
        let x = nelder_mead_1d(|x| (x + 2.0).abs() + 1.0, 0.1, 1e-6, 1e-10, 500);
        assert!((x + 2.0).abs() < 1e-3);
    }
}
