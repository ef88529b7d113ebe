//! Conditional gradient solvers for regularized optimal transport.
//!
//! Both solvers minimize a composite objective over the transport polytope
//! `U(a, b) = {γ ≥ 0 : γ1 = a, γᵀ1 = b}`:
//!
//! ```text
//! gcg:  F(γ) = <γ, M> + reg · Σ γ log γ + η · f(γ)
//! cg:   F(γ) = <γ, M> + η · f(γ)
//! ```
//!
//! At each outer step the smooth penalty `f` is linearized around the current plan,
//! the linearized problem is handed to a transport subsolver (Sinkhorn for `gcg`, the
//! exact simplex for `cg`), and a line search moves along the segment toward the
//! subsolver's plan. The line search always keeps `α = 0` as a candidate, so the
//! sequence of objective values never increases.
//!
//! # References
//!
//! - Rakotomamonjy, Flamary, Courty (2015). "Generalized conditional gradient:
//!   analysis of convergence and applications"
//! - Ferradans et al. (2014). "Regularized discrete optimal transport"

use crate::emd::{emd, EmdLog, DEFAULT_EMD_MAX_ITER};
use crate::{
    check_cost, check_marginals, frobenius, neg_entropy, relative_change, report_progress,
    sinkhorn, Error, Result, SinkhornLog,
};
use ndarray::{Array1, Array2};

/// Function evaluations spent by the golden-section search on `[0, 1]`.
const LINE_SEARCH_EVALS: usize = 40;

/// A smooth penalty `f(γ)` on transport plans, with its gradient.
///
/// The conditional gradient solvers only see a plan's penalty through this trait,
/// so one outer loop serves every regularizer.
pub trait Objective {
    /// Penalty value `f(γ)`.
    fn evaluate(&self, plan: &Array2<f64>) -> f64;

    /// Gradient `∇f(γ)`, same shape as `plan`.
    fn gradient(&self, plan: &Array2<f64>) -> Array2<f64>;
}

impl<T: Objective + ?Sized> Objective for &T {
    fn evaluate(&self, plan: &Array2<f64>) -> f64 {
        (**self).evaluate(plan)
    }

    fn gradient(&self, plan: &Array2<f64>) -> Array2<f64> {
        (**self).gradient(plan)
    }
}

/// Configuration for [`gcg`] and [`cg`].
#[derive(Debug, Clone)]
pub struct CgConfig {
    /// Outer iteration budget.
    pub max_iter: usize,
    /// Stop once the relative decrease of the objective falls below this.
    pub stop_thr: f64,
    /// Iteration budget of each inner Sinkhorn solve (`gcg` only).
    pub inner_max_iter: usize,
    /// Marginal tolerance of each inner Sinkhorn solve (`gcg` only).
    pub inner_stop_thr: f64,
    /// Emit the progress table through `log::info!`.
    pub verbose: bool,
    /// Return a [`CgLog`].
    pub log: bool,
}

impl Default for CgConfig {
    fn default() -> Self {
        Self {
            max_iter: 200,
            stop_thr: 1e-9,
            inner_max_iter: 200,
            inner_stop_thr: 1e-9,
            verbose: false,
            log: false,
        }
    }
}

/// Log of one inner transport solve.
#[derive(Debug, Clone, PartialEq)]
pub enum InnerLog {
    /// Entropic oracle of [`gcg`].
    Sinkhorn(SinkhornLog),
    /// Exact oracle of [`cg`].
    Emd(EmdLog),
}

/// Diagnostics of a conditional gradient run.
#[derive(Debug, Clone, Default)]
pub struct CgLog {
    /// Objective after initialization, then after every outer step.
    pub loss: Vec<f64>,
    /// Step size chosen by each line search.
    pub steps: Vec<f64>,
    /// Outer iterations performed.
    pub iterations: usize,
    /// `true` if the relative-decrease test stopped the loop (not the budget).
    pub converged: bool,
    /// Inner solver logs, including the initializing solve if any.
    pub inner: Vec<InnerLog>,
}

#[derive(Debug, Clone, Copy)]
enum Oracle {
    Entropic { reg: f64 },
    Exact,
}

impl Oracle {
    fn entropic_weight(self) -> f64 {
        match self {
            Oracle::Entropic { reg } => reg,
            Oracle::Exact => 0.0,
        }
    }

    fn solve(
        self,
        a: &Array1<f64>,
        b: &Array1<f64>,
        cost: &Array2<f64>,
        cfg: &CgConfig,
    ) -> Result<(Array2<f64>, InnerLog)> {
        match self {
            Oracle::Entropic { reg } => {
                let (plan, log) = sinkhorn(a, b, cost, reg, cfg.inner_max_iter, cfg.inner_stop_thr)?;
                Ok((plan, InnerLog::Sinkhorn(log)))
            }
            Oracle::Exact => {
                let (plan, log) = emd(a, b, cost, DEFAULT_EMD_MAX_ITER)?;
                Ok((plan, InnerLog::Emd(log)))
            }
        }
    }
}

/// Generalized conditional gradient for entropic OT with an extra smooth penalty.
///
/// Minimizes `<γ,M> + reg·Σγlogγ + eta·f(γ)` over `U(a, b)`. Starts from `g0`, or from
/// the entropic plan of the unpenalized problem. Each step solves Sinkhorn on
/// `M + eta·∇f(γ)` and line-searches toward its plan.
///
/// Inner Sinkhorn solves that exhaust their budget are used as they are.
///
/// # Errors
///
/// Invalid marginals or cost shape, `reg`/`eta` not positive and finite, `g0` of the
/// wrong shape.
#[allow(clippy::too_many_arguments)]
pub fn gcg<O: Objective + ?Sized>(
    a: &Array1<f64>,
    b: &Array1<f64>,
    cost: &Array2<f64>,
    reg: f64,
    eta: f64,
    objective: &O,
    g0: Option<&Array2<f64>>,
    cfg: &CgConfig,
) -> Result<(Array2<f64>, Option<CgLog>)> {
    if reg <= 0.0 || !reg.is_finite() {
        return Err(Error::InvalidRegularization(reg));
    }
    conditional_gradient(Oracle::Entropic { reg }, a, b, cost, eta, objective, g0, cfg)
}

/// Conditional gradient (Frank-Wolfe) with an exact transport oracle.
///
/// Minimizes `<γ,M> + eta·f(γ)` over `U(a, b)`. Starts from `g0`, or from `a bᵀ`.
/// Each step solves the exact problem on `M + eta·∇f(γ)`.
///
/// # Errors
///
/// Invalid marginals or cost shape, `eta` not positive and finite, `g0` of the wrong
/// shape.
pub fn cg<O: Objective + ?Sized>(
    a: &Array1<f64>,
    b: &Array1<f64>,
    cost: &Array2<f64>,
    eta: f64,
    objective: &O,
    g0: Option<&Array2<f64>>,
    cfg: &CgConfig,
) -> Result<(Array2<f64>, Option<CgLog>)> {
    conditional_gradient(Oracle::Exact, a, b, cost, eta, objective, g0, cfg)
}

#[allow(clippy::too_many_arguments)]
fn conditional_gradient<O: Objective + ?Sized>(
    oracle: Oracle,
    a: &Array1<f64>,
    b: &Array1<f64>,
    cost: &Array2<f64>,
    eta: f64,
    objective: &O,
    g0: Option<&Array2<f64>>,
    cfg: &CgConfig,
) -> Result<(Array2<f64>, Option<CgLog>)> {
    let (m, n) = (a.len(), b.len());
    check_marginals(a, b)?;
    check_cost(cost, m, n)?;
    if eta <= 0.0 || !eta.is_finite() {
        return Err(Error::InvalidPenalty(eta));
    }

    let reg = oracle.entropic_weight();
    let composite = |plan: &Array2<f64>| {
        let entropic = if reg > 0.0 { reg * neg_entropy(plan) } else { 0.0 };
        frobenius(plan, cost) + entropic + eta * objective.evaluate(plan)
    };

    let mut log = CgLog::default();
    let mut plan = match (g0, oracle) {
        (Some(g), _) => {
            if g.dim() != (m, n) {
                return Err(Error::CostShapeMismatch(m, n, g.nrows(), g.ncols()));
            }
            g.to_owned()
        }
        (None, Oracle::Entropic { .. }) => {
            let (plan, inner) = oracle.solve(a, b, cost, cfg)?;
            log.inner.push(inner);
            plan
        }
        (None, Oracle::Exact) => outer(a, b),
    };

    let mut value = composite(&plan);
    log.loss.push(value);
    report_progress(cfg.verbose, 0, value, 0.0);

    for it in 1..=cfg.max_iter {
        let linearized = cost + &(objective.gradient(&plan) * eta);
        let (candidate, inner) = oracle.solve(a, b, &linearized, cfg)?;
        log.inner.push(inner);

        let direction = &candidate - &plan;
        let (alpha, next_value) =
            line_search(|alpha| composite(&(&plan + &(&direction * alpha))), value);
        plan = &plan + &(&direction * alpha);

        let delta = relative_change(value, next_value);
        value = next_value;
        log.loss.push(value);
        log.steps.push(alpha);
        log.iterations = it;
        report_progress(cfg.verbose, it, value, delta);

        if delta < cfg.stop_thr {
            log.converged = true;
            break;
        }
    }

    Ok((plan, cfg.log.then_some(log)))
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// Minimize `phi` on `[0, 1]`, never returning a value above `phi0 = phi(0)`.
///
/// Golden-section search locates an interior candidate; the result is the best of
/// `{0, α*, 1}`, moving right only on strict improvement (ties keep the smaller step).
fn line_search(mut phi: impl FnMut(f64) -> f64, phi0: f64) -> (f64, f64) {
    let ratio = (5.0f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (0.0f64, 1.0f64);
    let mut x1 = hi - ratio * (hi - lo);
    let mut x2 = lo + ratio * (hi - lo);
    let mut f1 = phi(x1);
    let mut f2 = phi(x2);
    for _ in 0..LINE_SEARCH_EVALS {
        if f1 <= f2 {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - ratio * (hi - lo);
            f1 = phi(x1);
        } else {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + ratio * (hi - lo);
            f2 = phi(x2);
        }
    }
    let interior = if f1 <= f2 { (x1, f1) } else { (x2, f2) };

    let mut best = (0.0, phi0);
    for (alpha, value) in [interior, (1.0, phi(1.0))] {
        if value < best.1 {
            best = (alpha, value);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// `f(γ) = ½‖γ‖²`
    struct HalfSquaredNorm;

    impl Objective for HalfSquaredNorm {
        fn evaluate(&self, plan: &Array2<f64>) -> f64 {
            0.5 * plan.iter().map(|p| p * p).sum::<f64>()
        }

        fn gradient(&self, plan: &Array2<f64>) -> Array2<f64> {
            plan.clone()
        }
    }

    fn line_cost(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(i, j)| (i as f64 - j as f64).powi(2) / n as f64)
    }

    fn logged() -> CgConfig {
        CgConfig {
            inner_max_iter: 1000,
            log: true,
            ..CgConfig::default()
        }
    }

    #[test]
    fn line_search_finds_parabola_minimum() {
        let (alpha, value) = line_search(|x| (x - 0.3).powi(2), 0.09);
        assert!((alpha - 0.3).abs() < 1e-6, "alpha={}", alpha);
        assert!(value < 1e-12);
    }

    #[test]
    fn line_search_prefers_zero_on_ties() {
        let (alpha, value) = line_search(|_| 1.0, 1.0);
        assert_eq!(alpha, 0.0);
        assert_eq!(value, 1.0);
    }

    #[test]
    fn line_search_never_increases() {
        let (alpha, value) = line_search(|x| x, 0.0);
        assert_eq!(alpha, 0.0);
        assert_eq!(value, 0.0);
        let (alpha, _) = line_search(|x| -x, 0.0);
        assert_eq!(alpha, 1.0);
    }

    #[test]
    fn gcg_objective_is_non_increasing() {
        let a = array![0.1, 0.2, 0.3, 0.4];
        let b = array![0.25, 0.25, 0.25, 0.25];
        let cost = line_cost(4);
        let (plan, log) = gcg(&a, &b, &cost, 0.1, 1.0, &HalfSquaredNorm, None, &logged()).unwrap();
        let log = log.unwrap();
        assert!(log.iterations >= 1);
        for w in log.loss.windows(2) {
            assert!(w[1] <= w[0], "loss increased: {:?}", log.loss);
        }
        for i in 0..4 {
            assert!((plan.row(i).sum() - a[i]).abs() < 1e-6);
            assert!((plan.column(i).sum() - b[i]).abs() < 1e-6);
        }
        assert!(plan.iter().all(|&p| p >= 0.0));
        assert!(matches!(log.inner[0], InnerLog::Sinkhorn(_)));
    }

    #[test]
    fn cg_with_quadratic_spreads_mass() {
        // With a zero cost, minimizing ½‖γ‖² over U(a, b) gives the product plan.
        let a = array![0.5, 0.5];
        let b = array![0.5, 0.5];
        let cost = Array2::zeros((2, 2));
        let g0 = array![[0.5, 0.0], [0.0, 0.5]];
        let (plan, log) = cg(&a, &b, &cost, 1.0, &HalfSquaredNorm, Some(&g0), &logged()).unwrap();
        let log = log.unwrap();
        assert!((plan[[0, 1]] - 0.25).abs() < 1e-6, "plan={:?}", plan);
        assert!((log.loss.last().unwrap() - 0.125).abs() < 1e-9);
        assert!(matches!(log.inner[0], InnerLog::Emd(_)));
    }

    #[test]
    fn zero_budget_returns_start() {
        let a = array![0.5, 0.5];
        let cost = line_cost(2);
        let cfg = CgConfig {
            max_iter: 0,
            log: true,
            ..CgConfig::default()
        };
        let (plan, log) = cg(&a, &a, &cost, 1.0, &HalfSquaredNorm, None, &cfg).unwrap();
        assert_eq!(plan, Array2::from_elem((2, 2), 0.25));
        let log = log.unwrap();
        assert_eq!(log.iterations, 0);
        assert_eq!(log.loss.len(), 1);
    }

    #[test]
    fn log_is_omitted_unless_requested() {
        let a = array![0.5, 0.5];
        let cost = line_cost(2);
        let (_, log) = gcg(&a, &a, &cost, 0.5, 0.1, &HalfSquaredNorm, None, &CgConfig::default()).unwrap();
        assert!(log.is_none());
    }

    #[test]
    fn rejects_invalid_input_before_iterating() {
        let a = array![0.5, 0.5];
        let cost = line_cost(2);
        let cfg = CgConfig::default();
        assert!(matches!(
            gcg(&a, &a, &cost, -1.0, 1.0, &HalfSquaredNorm, None, &cfg),
            Err(Error::InvalidRegularization(_))
        ));
        assert!(matches!(
            gcg(&a, &a, &cost, 1.0, 0.0, &HalfSquaredNorm, None, &cfg),
            Err(Error::InvalidPenalty(_))
        ));
        assert!(matches!(
            cg(&a, &array![0.7, 0.7], &cost, 1.0, &HalfSquaredNorm, None, &cfg),
            Err(Error::MassMismatch(..))
        ));
        let bad_start = Array2::zeros((3, 2));
        assert!(matches!(
            cg(&a, &a, &cost, 1.0, &HalfSquaredNorm, Some(&bad_start), &cfg),
            Err(Error::CostShapeMismatch(..))
        ));
    }
}
