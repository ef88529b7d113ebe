//! # otda
//!
//! Optimal transport for domain adaptation: couple a labeled source sample set to a
//! target sample set, then move source points (or new points) into the target domain.
//!
//! ## The Problem
//!
//! Source and target samples come from related but shifted distributions. A transport
//! plan (coupling) `γ` says how much mass each source sample sends to each target
//! sample. Plain OT ignores class structure and gives no map for unseen points; the
//! solvers here add both:
//!
//! - **group regularization** keeps each target point fed by a single source class;
//! - **joint mapping estimation** learns a linear or kernel map together with `γ`.
//!
//! ## Key Functions
//!
//! | Function | Problem | Method |
//! |----------|---------|--------|
//! | [`sinkhorn`] | entropic OT | log-domain scaling |
//! | [`emd::emd`] | exact OT | transportation simplex |
//! | [`optim::gcg`] | `<γ,M> + reg·Ω_e(γ) + η·f(γ)` | generalized conditional gradient |
//! | [`optim::cg`] | `<γ,M> + η·f(γ)` | conditional gradient (exact oracle) |
//! | [`group::sinkhorn_lpl1_mm`] | Lp-L1 class sparsity | majorize-minimize |
//! | [`group::sinkhorn_l1l2_gl`] | L1-L2 group lasso | GCG |
//! | [`mapping::joint_mapping_linear`] | coupling + linear map | block coordinate descent |
//! | [`mapping::joint_mapping_kernel`] | coupling + kernel map | block coordinate descent |
//! | [`adapt::DomainTransport`] | fit + transport samples | any of the above |
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::array;
//! use otda::cost::{dist, unif, Metric};
//! use otda::group::{sinkhorn_l1l2_gl, GroupConfig};
//!
//! let xs = array![[0.0, 0.0], [0.1, 0.0], [4.0, 0.0], [4.1, 0.0]];
//! let ys = [0, 0, 1, 1];
//! let xt = array![[0.0, 1.0], [0.1, 1.0], [4.0, 1.0], [4.1, 1.0]];
//!
//! let cost = dist(&xs, &xt, Metric::SqEuclidean).unwrap();
//! let (a, b) = (unif(4), unif(4));
//! let (plan, _) = sinkhorn_l1l2_gl(&a, &ys, &b, &cost, 0.5, &GroupConfig::default()).unwrap();
//! assert_eq!(plan.dim(), (4, 4));
//! ```
//!
//! ## What Can Go Wrong
//!
//! 1. **Sinkhorn not converging**: not an error. Solvers return the last iterate and
//!    report `converged = false` in their logs.
//! 2. **Marginal mismatch**: `a` and `b` must carry the same total mass; nothing is
//!    renormalized silently.
//! 3. **Small `reg`**: log-domain updates avoid overflow, but convergence slows down.
//!    Rescale the cost (see [`cost::normalize_cost`]) before lowering `reg`.
//!
//! ## References
//!
//! - Courty, Flamary, Tuia, Rakotomamonjy (2017). "Optimal Transport for Domain Adaptation"
//! - Rakotomamonjy, Flamary, Courty (2015). "Generalized conditional gradient: analysis
//!   of convergence and applications"
//! - Perrot, Courty, Flamary, Habrard (2016). "Mapping estimation for discrete optimal
//!   transport"

use log::{debug, info};
use ndarray::{Array1, Array2};
use thiserror::Error;

pub mod adapt;
pub mod cost;
pub mod emd;
pub mod group;
pub mod linalg;
pub mod mapping;
pub mod optim;

pub use adapt::{CouplingMethod, Direction, DomainTransport};
pub use group::{sinkhorn_l1l2_gl, sinkhorn_lpl1_mm, ClassGroups, GroupConfig};
pub use mapping::{joint_mapping_kernel, joint_mapping_linear, JointMappingConfig};
pub use optim::{cg, gcg, CgConfig, Objective};

/// Domain-adaptation OT error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// Two sequences that must align have different lengths.
    #[error("length mismatch: expected {0}, got {1}")]
    LengthMismatch(usize, usize),

    /// Cost (or coupling) matrix shape mismatch.
    #[error("matrix shape mismatch: expected ({0}, {1}), got ({2}, {3})")]
    CostShapeMismatch(usize, usize, usize, usize),

    /// Sample sets live in spaces of different dimension.
    #[error("feature dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    /// Marginals do not carry the same total mass.
    #[error("marginals have different total mass: {0} vs {1}")]
    MassMismatch(f64, f64),

    /// Entropic regularization (or transport weight) is not positive and finite.
    #[error("regularization parameter must be positive and finite, got {0}")]
    InvalidRegularization(f64),

    /// Penalty weight is not positive and finite.
    #[error("penalty weight must be positive and finite, got {0}")]
    InvalidPenalty(f64),

    /// A mass vector has a negative entry.
    #[error("{0} must be nonnegative")]
    NonNegative(&'static str),

    /// An input that must be non-empty is empty.
    #[error("{0} must not be empty")]
    EmptyInput(&'static str),

    /// Label array is inconsistent with the samples it labels.
    #[error("invalid labels: {0}")]
    InvalidLabels(&'static str),

    /// Linear system has no unique solution, or a Cholesky system is not positive
    /// definite.
    #[error("singular matrix in linear solve (pivot {0:e} at row {1})")]
    SingularMatrix(f64, usize),

    /// Domain error (invalid inputs for the mathematical definition).
    #[error("{0}")]
    Domain(&'static str),
}

/// Result type for domain-adaptation OT operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Relative tolerance on `|sum(a) - sum(b)|`.
const MASS_TOL: f64 = 1e-6;

/// Marginal error is measured every `SINKHORN_CHECK_EVERY` iterations.
const SINKHORN_CHECK_EVERY: usize = 10;

/// Numerically stable \(\log \sum_i \exp(x_i)\) for an indexable family.
///
/// Returns `-∞` if `len == 0` or every term is `-∞`.
#[inline]
fn logsumexp_by(len: usize, mut f: impl FnMut(usize) -> f64) -> f64 {
    let mut max_val = f64::NEG_INFINITY;
    for i in 0..len {
        max_val = max_val.max(f(i));
    }
    if !max_val.is_finite() {
        return max_val;
    }

    let mut sum_exp = 0.0;
    for i in 0..len {
        sum_exp += (f(i) - max_val).exp();
    }
    max_val + sum_exp.ln()
}

/// Validate a pair of marginals: non-empty, nonnegative, same positive total mass.
pub(crate) fn check_marginals(a: &Array1<f64>, b: &Array1<f64>) -> Result<()> {
    if a.is_empty() {
        return Err(Error::EmptyInput("source marginal"));
    }
    if b.is_empty() {
        return Err(Error::EmptyInput("target marginal"));
    }
    if a.iter().any(|&x| x < 0.0 || x.is_nan()) {
        return Err(Error::NonNegative("source marginal"));
    }
    if b.iter().any(|&x| x < 0.0 || x.is_nan()) {
        return Err(Error::NonNegative("target marginal"));
    }
    let (sa, sb) = (a.sum(), b.sum());
    if sa <= 0.0 || sb <= 0.0 {
        return Err(Error::Domain("marginals must have positive total mass"));
    }
    if (sa - sb).abs() > MASS_TOL * sa.max(sb) {
        return Err(Error::MassMismatch(sa, sb));
    }
    Ok(())
}

pub(crate) fn check_cost(cost: &Array2<f64>, m: usize, n: usize) -> Result<()> {
    if cost.nrows() != m || cost.ncols() != n {
        return Err(Error::CostShapeMismatch(m, n, cost.nrows(), cost.ncols()));
    }
    Ok(())
}

/// Frobenius inner product `<plan, cost>`.
///
/// Entries where the plan is exactly zero contribute nothing, even against an
/// infinite (forbidden) cost.
pub fn frobenius(plan: &Array2<f64>, cost: &Array2<f64>) -> f64 {
    plan.iter()
        .zip(cost.iter())
        .filter(|(&p, _)| p != 0.0)
        .map(|(&p, &c)| p * c)
        .sum()
}

/// Negative entropy `Ω_e(γ) = Σ γ log γ`, with `0 log 0 = 0`.
pub fn neg_entropy(plan: &Array2<f64>) -> f64 {
    plan.iter().filter(|&&p| p > 0.0).map(|&p| p * p.ln()).sum()
}

/// Relative change `|prev - cur| / |prev|` used by every outer stopping rule.
///
/// At `prev == 0` the ratio is undefined; the absolute change `|cur|` is returned
/// instead, so the caller's threshold acts as an absolute tolerance there.
pub fn relative_change(prev: f64, cur: f64) -> f64 {
    if prev == 0.0 {
        (prev - cur).abs()
    } else {
        (prev - cur).abs() / prev.abs()
    }
}

/// One row of the `It. | Loss | Delta loss` progress table.
///
/// With `verbose` the table goes to `info!` (header repeated every 20 rows);
/// otherwise rows are only traced at `debug!`.
pub(crate) fn report_progress(verbose: bool, it: usize, loss: f64, delta: f64) {
    if verbose {
        if it % 20 == 0 {
            info!("{:5}|{:12}|{:8}", "It.", "Loss", "Delta loss");
            info!("{}", "-".repeat(32));
        }
        info!("{:5}|{:8e}|{:8e}", it, loss, delta);
    } else {
        debug!("it={} loss={:e} delta={:e}", it, loss, delta);
    }
}

/// Diagnostics of one [`sinkhorn`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkhornLog {
    /// Scaling iterations actually run.
    pub iterations: usize,
    /// Last measured max violation of the row marginal.
    pub marginal_error: f64,
    /// Whether `marginal_error` dropped below the threshold.
    pub converged: bool,
}

/// Sinkhorn algorithm in log-space for entropic regularized optimal transport.
///
/// Solves:
///
/// min_P <C, P> + ε Σ P_ij log P_ij
/// s.t. P1 = a, P^T1 = b, P ≥ 0
///
/// Dual potentials are updated with the log-sum-exp trick:
/// f_i = ε log(a_i) - ε log(Σ_j exp((g_j - C_ij) / ε)), and symmetrically for g.
/// Zero-mass bins are a hard support exclusion: their plan rows/columns are exactly 0.
/// The cost may be negative (linearized costs in [`optim`] are).
///
/// The marginal error is checked every few iterations; once it is below `stop_thr`
/// the loop stops. Exhausting `max_iter` is **not** an error: the last iterate is
/// returned with `converged = false` in the log.
///
/// # Errors
///
/// Shape mismatch, `reg` not positive/finite, invalid marginals (negative, empty,
/// different totals), `max_iter == 0`.
///
/// # Example
///
/// ```rust
/// use ndarray::array;
///
/// let a = array![0.5, 0.5];
/// let b = array![0.5, 0.5];
/// let cost = array![[0.0, 1.0], [1.0, 0.0]];
///
/// let (plan, log) = otda::sinkhorn(&a, &b, &cost, 0.1, 1000, 1e-9).unwrap();
/// assert!(log.converged);
/// assert!(plan[[0, 0]] > plan[[0, 1]]);
/// ```
pub fn sinkhorn(
    a: &Array1<f64>,
    b: &Array1<f64>,
    cost: &Array2<f64>,
    reg: f64,
    max_iter: usize,
    stop_thr: f64,
) -> Result<(Array2<f64>, SinkhornLog)> {
    let m = a.len();
    let n = b.len();
    check_marginals(a, b)?;
    check_cost(cost, m, n)?;
    if reg <= 0.0 || !reg.is_finite() {
        return Err(Error::InvalidRegularization(reg));
    }
    if max_iter == 0 {
        return Err(Error::Domain("sinkhorn requires max_iter >= 1"));
    }

    let log_a = a.mapv(|x| if x <= 0.0 { f64::NEG_INFINITY } else { x.ln() });
    let log_b = b.mapv(|x| if x <= 0.0 { f64::NEG_INFINITY } else { x.ln() });

    let mut f: Array1<f64> = Array1::zeros(m);
    let mut g: Array1<f64> = Array1::zeros(n);
    let mut log = SinkhornLog::default();

    for iter in 0..max_iter {
        for i in 0..m {
            let lse = logsumexp_by(n, |j| (g[j] - cost[[i, j]]) / reg);
            f[i] = reg * (log_a[i] - lse);
        }
        for j in 0..n {
            let lse = logsumexp_by(m, |i| (f[i] - cost[[i, j]]) / reg);
            g[j] = reg * (log_b[j] - lse);
        }
        log.iterations = iter + 1;

        if (iter + 1) % SINKHORN_CHECK_EVERY == 0 || iter + 1 == max_iter {
            // Columns are exact right after the g-update; only rows can be off.
            let mut max_err = 0.0f64;
            for i in 0..m {
                if log_a[i] == f64::NEG_INFINITY {
                    continue;
                }
                let lse = logsumexp_by(n, |j| (g[j] - cost[[i, j]]) / reg);
                let row_sum = (f[i] / reg + lse).exp();
                max_err = max_err.max((row_sum - a[i]).abs());
            }
            log.marginal_error = max_err;
            if max_err < stop_thr {
                log.converged = true;
                break;
            }
        }
    }

    let mut plan = Array2::zeros((m, n));
    for i in 0..m {
        if log_a[i] == f64::NEG_INFINITY {
            continue;
        }
        for j in 0..n {
            if log_b[j] == f64::NEG_INFINITY {
                continue;
            }
            plan[[i, j]] = ((f[i] + g[j] - cost[[i, j]]) / reg).exp();
        }
    }

    Ok((plan, log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    fn line_cost(m: usize, n: usize) -> Array2<f64> {
        Array2::from_shape_fn((m, n), |(i, j)| (i as f64 - j as f64).powi(2))
    }

    #[test]
    fn sinkhorn_matches_marginals() {
        let a = array![0.2, 0.3, 0.5];
        let b = array![0.4, 0.4, 0.2];
        let cost = line_cost(3, 3);
        let (plan, log) = sinkhorn(&a, &b, &cost, 0.5, 2000, 1e-10).unwrap();
        assert!(log.converged, "log={:?}", log);
        for i in 0..3 {
            assert!((plan.row(i).sum() - a[i]).abs() < 1e-8);
            assert!((plan.column(i).sum() - b[i]).abs() < 1e-8);
        }
    }

    #[test]
    fn sinkhorn_budget_exhaustion_is_not_an_error() {
        let a = array![0.1, 0.9];
        let b = array![0.9, 0.1];
        let cost = array![[0.0, 1.0], [1.0, 0.0]];
        let (plan, log) = sinkhorn(&a, &b, &cost, 0.01, 1, 1e-15).unwrap();
        assert_eq!(log.iterations, 1);
        assert!(!log.converged);
        assert!(plan.iter().all(|p| p.is_finite() && *p >= 0.0));
    }

    #[test]
    fn sinkhorn_zero_mass_bins_carry_nothing() {
        let a = array![0.5, 0.0, 0.5];
        let b = array![0.0, 1.0];
        let cost = line_cost(3, 2);
        let (plan, log) = sinkhorn(&a, &b, &cost, 0.5, 100, 1e-10).unwrap();
        assert!(log.converged);
        assert!(plan.row(1).iter().all(|&p| p == 0.0));
        assert!(plan.column(0).iter().all(|&p| p == 0.0));
        assert!((plan[[0, 1]] - 0.5).abs() < 1e-10);
    }

    #[test]
    fn sinkhorn_accepts_negative_costs() {
        let a = array![0.5, 0.5];
        let b = array![0.5, 0.5];
        let cost = array![[-3.0, -1.0], [-1.0, -3.0]];
        let (plan, log) = sinkhorn(&a, &b, &cost, 0.2, 1000, 1e-9).unwrap();
        assert!(log.converged);
        assert!(plan[[0, 0]] > 0.4);
    }

    #[test]
    fn sinkhorn_rejects_bad_input() {
        let a = array![0.5, 0.5];
        let b = array![0.5, 0.5];
        let cost = array![[0.0, 1.0], [1.0, 0.0]];
        assert!(matches!(
            sinkhorn(&a, &b, &cost, 0.0, 10, 1e-9),
            Err(Error::InvalidRegularization(_))
        ));
        assert!(matches!(
            sinkhorn(&a, &array![0.5, 0.25], &cost, 0.1, 10, 1e-9),
            Err(Error::MassMismatch(..))
        ));
        assert!(matches!(
            sinkhorn(&a, &array![0.5, 0.25, 0.25], &cost, 0.1, 10, 1e-9),
            Err(Error::CostShapeMismatch(..))
        ));
        assert!(matches!(
            sinkhorn(&array![1.5, -0.5], &b, &cost, 0.1, 10, 1e-9),
            Err(Error::NonNegative(_))
        ));
    }

    #[test]
    fn relative_change_falls_back_to_absolute_at_zero() {
        assert_eq!(relative_change(0.0, 1e-12), 1e-12);
        assert!((relative_change(2.0, 1.0) - 0.5).abs() < 1e-15);
        assert!((relative_change(-2.0, -1.0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn frobenius_ignores_forbidden_cells_without_mass() {
        let plan = array![[0.5, 0.0], [0.0, 0.5]];
        let cost = array![[1.0, f64::INFINITY], [f64::INFINITY, 3.0]];
        assert!((frobenius(&plan, &cost) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn neg_entropy_of_uniform_plan() {
        let plan = Array2::from_elem((2, 2), 0.25);
        assert!((neg_entropy(&plan) - 0.25f64.ln()).abs() < 1e-12);
        assert_eq!(neg_entropy(&Array2::zeros((2, 2))), 0.0);
    }

    proptest! {
        #[test]
        fn logsumexp_translation_invariant(
            xs in prop::collection::vec(-50.0f64..50.0, 1..64),
            shift in -10.0f64..10.0
        ) {
            let l1 = logsumexp_by(xs.len(), |i| xs[i]);
            let l2 = logsumexp_by(xs.len(), |i| xs[i] + shift);
            prop_assert!((l2 - (l1 + shift)).abs() < 1e-9);
        }

        #[test]
        fn sinkhorn_plan_is_nonnegative_with_target_columns(
            (a, b) in (2usize..6, 2usize..6).prop_flat_map(|(m, n)| {
                (
                    prop::collection::vec(0.05f64..1.0, m),
                    prop::collection::vec(0.05f64..1.0, n),
                )
            }),
        ) {
            let mut a = Array1::from_vec(a);
            let mut b = Array1::from_vec(b);
            a /= a.sum();
            b /= b.sum();
            let cost = line_cost(a.len(), b.len());
            let (plan, _) = sinkhorn(&a, &b, &cost, 1.0, 500, 1e-9).unwrap();
            prop_assert!(plan.iter().all(|&p| p >= 0.0 && p.is_finite()));
            for j in 0..b.len() {
                prop_assert!((plan.column(j).sum() - b[j]).abs() < 1e-9);
            }
        }
    }
}
