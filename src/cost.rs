//! Ground costs, kernels and sample weights.

use crate::{Error, Result};
use ndarray::{Array1, Array2};

/// Uniform weights `1/n` over `n` samples.
pub fn unif(n: usize) -> Array1<f64> {
    Array1::from_elem(n, 1.0 / n as f64)
}

/// Ground metric between samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    /// `‖x - y‖²`
    #[default]
    SqEuclidean,
    /// `‖x - y‖`
    Euclidean,
}

/// Pairwise cost matrix `C[i, j] = metric(x_i, y_j)` between the rows of `x` and `y`.
///
/// # Example
///
/// ```rust
/// use ndarray::array;
/// use otda::cost::{dist, Metric};
///
/// let x = array![[0.0, 0.0], [1.0, 0.0]];
/// let y = array![[0.0, 2.0]];
/// let c = dist(&x, &y, Metric::SqEuclidean).unwrap();
/// assert_eq!(c, array![[4.0], [5.0]]);
/// ```
pub fn dist(x: &Array2<f64>, y: &Array2<f64>, metric: Metric) -> Result<Array2<f64>> {
    let d = x.ncols();
    if y.ncols() != d {
        return Err(Error::DimensionMismatch(d, y.ncols()));
    }
    let mut cost = Array2::zeros((x.nrows(), y.nrows()));
    for (i, xi) in x.outer_iter().enumerate() {
        for (j, yj) in y.outer_iter().enumerate() {
            let sq: f64 = xi.iter().zip(yj.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
            cost[[i, j]] = match metric {
                Metric::SqEuclidean => sq,
                Metric::Euclidean => sq.sqrt(),
            };
        }
    }
    Ok(cost)
}

/// Positive-definite kernel used by the kernel mapping estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// `k(x, y) = exp(-‖x - y‖² / (2σ²))`
    Gaussian { sigma: f64 },
}

impl Kernel {
    pub fn gaussian(sigma: f64) -> Self {
        Kernel::Gaussian { sigma }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::Gaussian { sigma: 1.0 }
    }
}

/// Gram matrix `K[i, j] = k(x_i, y_j)`.
///
/// # Errors
///
/// Dimension mismatch, bandwidth not positive and finite.
pub fn kernel(x: &Array2<f64>, y: &Array2<f64>, kernel: Kernel) -> Result<Array2<f64>> {
    match kernel {
        Kernel::Gaussian { sigma } => {
            if sigma <= 0.0 || !sigma.is_finite() {
                return Err(Error::Domain("gaussian kernel bandwidth must be positive and finite"));
            }
            let denom = 2.0 * sigma * sigma;
            Ok(dist(x, y, Metric::SqEuclidean)?.mapv(|d| (-d / denom).exp()))
        }
    }
}

/// Rescaling applied to a cost matrix before solving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostNormalization {
    /// Divide by the median entry.
    Median,
    /// Divide by the largest entry.
    Max,
    /// `log(1 + C)`
    Log,
    /// `log(1 + log(1 + C))`
    LogLog,
}

/// Return a rescaled copy of `cost`.
///
/// A zero median (or max) divides by zero; the resulting non-finite entries are
/// returned as is.
pub fn normalize_cost(cost: &Array2<f64>, norm: CostNormalization) -> Array2<f64> {
    match norm {
        CostNormalization::Median => {
            let m = median(cost);
            cost.mapv(|c| c / m)
        }
        CostNormalization::Max => {
            let m = cost.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            cost.mapv(|c| c / m)
        }
        CostNormalization::Log => cost.mapv(f64::ln_1p),
        CostNormalization::LogLog => cost.mapv(|c| c.ln_1p().ln_1p()),
    }
}

fn median(x: &Array2<f64>) -> f64 {
    let mut values: Vec<f64> = x.iter().copied().collect();
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let k = values.len() / 2;
    if values.len() % 2 == 1 {
        values[k]
    } else {
        0.5 * (values[k - 1] + values[k])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn unif_sums_to_one() {
        let w = unif(7);
        assert!((w.sum() - 1.0).abs() < 1e-12);
        assert!(w.iter().all(|&x| (x - 1.0 / 7.0).abs() < 1e-15));
    }

    #[test]
    fn euclidean_is_root_of_squared() {
        let x = array![[0.0, 0.0], [1.0, 1.0]];
        let y = array![[3.0, 4.0]];
        let sq = dist(&x, &y, Metric::SqEuclidean).unwrap();
        let eu = dist(&x, &y, Metric::Euclidean).unwrap();
        assert_eq!(sq[[0, 0]], 25.0);
        assert_eq!(eu[[0, 0]], 5.0);
        assert!((eu[[1, 0]] - 13.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn dist_rejects_dimension_mismatch() {
        let x = array![[0.0, 0.0]];
        let y = array![[0.0]];
        assert!(matches!(
            dist(&x, &y, Metric::SqEuclidean),
            Err(Error::DimensionMismatch(2, 1))
        ));
    }

    #[test]
    fn gaussian_kernel_has_unit_diagonal() {
        let x = array![[0.0], [1.0], [3.0]];
        let k = kernel(&x, &x, Kernel::gaussian(2.0)).unwrap();
        for i in 0..3 {
            assert!((k[[i, i]] - 1.0).abs() < 1e-15);
        }
        assert!((k[[0, 1]] - (-1.0f64 / 8.0).exp()).abs() < 1e-15);
        assert_eq!(k[[0, 1]], k[[1, 0]]);
        assert!(kernel(&x, &x, Kernel::gaussian(0.0)).is_err());
    }

    #[test]
    fn normalizations() {
        let c = array![[1.0, 2.0], [3.0, 8.0]];
        let med = normalize_cost(&c, CostNormalization::Median);
        assert!((med[[1, 1]] - 8.0 / 2.5).abs() < 1e-12);
        let max = normalize_cost(&c, CostNormalization::Max);
        assert_eq!(max[[1, 1]], 1.0);
        let log = normalize_cost(&c, CostNormalization::Log);
        assert!((log[[0, 0]] - 2.0f64.ln()).abs() < 1e-12);
        let loglog = normalize_cost(&c, CostNormalization::LogLog);
        assert!((loglog[[0, 0]] - (1.0 + 2.0f64.ln()).ln()).abs() < 1e-12);
    }
}
