//! Joint estimation of a coupling and a transport map.
//!
//! Barycentric mapping only moves the training samples. To move unseen points, the
//! coupling `γ` and a parametric map `L` are learned together by minimizing
//!
//! ```text
//! J(γ, L) = ‖Φ L − ns·γ·Xt‖²_F + mu·<γ, M> + eta·R(L),    M = ns·‖xs_i − xt_j‖²
//! ```
//!
//! where `Φ` is the source feature matrix (`Xs` for a linear map, the Gram matrix
//! `K(Xs, Xs)` for a kernel map, optionally with a ones column for a bias).
//!
//! Block coordinate descent alternates the two blocks:
//!
//! - `L` given `γ`: a regularized least-squares problem, solved in closed form;
//! - `γ` given `L`: a transport problem with a smooth penalty, solved by the
//!   conditional gradient [`cg`] warm-started from the previous coupling.
//!
//! Both steps are exact block minimizations (up to the inner budget), so the loss
//! trace is non-increasing.
//!
//! # References
//!
//! - Perrot, Courty, Flamary, Habrard (2016). "Mapping estimation for discrete
//!   optimal transport"

use crate::cost::{dist, kernel, unif, Kernel, Metric};
use crate::emd::{emd, EmdLog, DEFAULT_EMD_MAX_ITER};
use crate::linalg::{sq_frobenius, Factorization};
use crate::optim::{cg, CgConfig, CgLog, Objective};
use crate::{frobenius, relative_change, report_progress, Error, Result};
use ndarray::{Array1, Array2};

/// Configuration for [`joint_mapping_linear`] and [`joint_mapping_kernel`].
#[derive(Debug, Clone)]
pub struct JointMappingConfig {
    /// Weight of the transport cost `<γ, M>`.
    pub mu: f64,
    /// Weight of the map regularizer `R(L)`.
    pub eta: f64,
    /// Fit an affine map (extra ones column in the features).
    pub bias: bool,
    /// Block coordinate descent rounds; `0` fits `L` once on the initial coupling.
    pub max_iter: usize,
    /// Conditional gradient steps per coupling update.
    pub inner_max_iter: usize,
    /// Relative-decrease threshold of each coupling update.
    pub inner_stop_thr: f64,
    /// Relative-decrease threshold of the outer loop.
    pub stop_thr: f64,
    /// Emit the progress table through `log::info!`.
    pub verbose: bool,
    /// Return a [`BcdLog`].
    pub log: bool,
}

impl Default for JointMappingConfig {
    fn default() -> Self {
        Self {
            mu: 1.0,
            eta: 0.001,
            bias: false,
            max_iter: 100,
            inner_max_iter: 10,
            inner_stop_thr: 1e-6,
            stop_thr: 1e-5,
            verbose: false,
            log: false,
        }
    }
}

/// Diagnostics of a block coordinate descent run.
#[derive(Debug, Clone)]
pub struct BcdLog {
    /// Joint objective after the initial fit, then after every round.
    pub loss: Vec<f64>,
    /// Rounds performed.
    pub iterations: usize,
    /// `true` if the relative-decrease test stopped the loop.
    pub converged: bool,
    /// Log of the exact transport solve giving the initial coupling.
    pub initial: EmdLog,
    /// Conditional gradient logs, one per coupling update.
    pub inner: Vec<CgLog>,
}

/// Result of a joint estimation: coupling, fitted map, optional log.
#[derive(Debug, Clone)]
pub struct JointMapping<M> {
    pub coupling: Array2<f64>,
    pub mapping: M,
    pub log: Option<BcdLog>,
}

/// A fitted linear (or affine) map `x ↦ [x, 1?]·L`.
#[derive(Debug, Clone)]
pub struct LinearMapping {
    /// `d × d`, or `(d+1) × d` with bias (last row is the translation).
    pub matrix: Array2<f64>,
    pub bias: bool,
}

impl LinearMapping {
    /// Apply the map to the rows of `x`.
    ///
    /// # Errors
    ///
    /// `x` has a feature dimension different from the fitted one.
    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let d = self.matrix.ncols();
        if x.ncols() != d {
            return Err(Error::DimensionMismatch(d, x.ncols()));
        }
        let features = if self.bias { with_ones(x) } else { x.to_owned() };
        Ok(features.dot(&self.matrix))
    }
}

/// A fitted kernel map `x ↦ [k(x, Xs), 1?]·L`.
#[derive(Debug, Clone)]
pub struct KernelMapping {
    /// `ns × d`, or `(ns+1) × d` with bias.
    pub matrix: Array2<f64>,
    /// Source samples the kernel is evaluated against.
    pub support: Array2<f64>,
    pub kernel: Kernel,
    pub bias: bool,
}

impl KernelMapping {
    /// Apply the map to the rows of `x`.
    ///
    /// # Errors
    ///
    /// `x` does not live in the source feature space.
    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let k = kernel(x, &self.support, self.kernel)?;
        let features = if self.bias { with_ones(&k) } else { k };
        Ok(features.dot(&self.matrix))
    }
}

/// `[x, 1]`
fn with_ones(x: &Array2<f64>) -> Array2<f64> {
    let d = x.ncols();
    Array2::from_shape_fn((x.nrows(), d + 1), |(i, j)| if j < d { x[[i, j]] } else { 1.0 })
}

/// Identity of size `n` with the last diagonal entry zeroed when `bias` is set.
fn bias_free_identity(n: usize, bias: bool) -> Array2<f64> {
    let mut eye = Array2::<f64>::eye(n);
    if bias {
        eye[[n - 1, n - 1]] = 0.0;
    }
    eye
}

/// The `L` block of the joint objective.
trait MappingProblem {
    /// Feature matrix `Φ` (one row per source sample).
    fn features(&self) -> &Array2<f64>;

    /// `argmin_L ‖Φ L − target‖² + eta·R(L)`.
    fn solve(&self, target: &Array2<f64>) -> Result<Array2<f64>>;

    /// `R(L)`, unweighted.
    fn regularizer(&self, l: &Array2<f64>) -> f64;
}

struct LinearProblem {
    phi: Array2<f64>,
    /// `ΦᵀΦ + eta·I`, factored.
    normal: Factorization,
    /// `I₀ = I[:, :d]`
    prior: Array2<f64>,
    eta: f64,
    bias: bool,
}

impl LinearProblem {
    fn new(xs: &Array2<f64>, eta: f64, bias: bool) -> Result<Self> {
        let d = xs.ncols();
        let phi = if bias { with_ones(xs) } else { xs.to_owned() };
        let eye = bias_free_identity(phi.ncols(), bias);
        let normal = Factorization::lu(&(phi.t().dot(&phi) + &(&eye * eta)))?;
        let prior = eye.slice(ndarray::s![.., ..d]).to_owned();
        Ok(Self {
            phi,
            normal,
            prior,
            eta,
            bias,
        })
    }
}

impl MappingProblem for LinearProblem {
    fn features(&self) -> &Array2<f64> {
        &self.phi
    }

    fn solve(&self, target: &Array2<f64>) -> Result<Array2<f64>> {
        let rhs = self.phi.t().dot(target) + &(&self.prior * self.eta);
        self.normal.solve(&rhs)
    }

    fn regularizer(&self, l: &Array2<f64>) -> f64 {
        let diff = l - &self.prior;
        let rows = if self.bias { diff.nrows() - 1 } else { diff.nrows() };
        sq_frobenius(&diff.slice(ndarray::s![..rows, ..]).to_owned())
    }
}

struct KernelProblem {
    phi: Array2<f64>,
    /// Left-hand side of the normal equations, factored.
    system: Factorization,
    /// RKHS metric: `K`, or `diag-block(K, 1)` with bias.
    metric: Array2<f64>,
    bias: bool,
}

impl KernelProblem {
    fn new(gram: Array2<f64>, eta: f64, bias: bool) -> Result<Self> {
        let ns = gram.nrows();
        if bias {
            let phi = with_ones(&gram);
            let mut metric = Array2::<f64>::eye(ns + 1);
            metric.slice_mut(ndarray::s![..ns, ..ns]).assign(&gram);
            // Positive semidefinite only: duplicate source points make it singular.
            let system = Factorization::lu(&(phi.t().dot(&phi) + &(&metric * eta)))?;
            Ok(Self {
                phi,
                system,
                metric,
                bias,
            })
        } else {
            let system = Factorization::llt(&(&gram + &(Array2::<f64>::eye(ns) * eta)))?;
            Ok(Self {
                phi: gram.clone(),
                system,
                metric: gram,
                bias,
            })
        }
    }
}

impl MappingProblem for KernelProblem {
    fn features(&self) -> &Array2<f64> {
        &self.phi
    }

    fn solve(&self, target: &Array2<f64>) -> Result<Array2<f64>> {
        if self.bias {
            self.system.solve(&self.phi.t().dot(target))
        } else {
            // K symmetric: (K + eta·I) L = target is the stationarity condition
            // premultiplied by K⁻¹.
            self.system.solve(target)
        }
    }

    fn regularizer(&self, l: &Array2<f64>) -> f64 {
        // tr(Lᵀ K L)
        (l * &self.metric.dot(l)).sum()
    }
}

/// Coupling block penalty `f(γ) = ‖Φ L − ns·γ·Xt‖²` for fixed `L`.
struct BarycentricFit<'a> {
    fitted: Array2<f64>,
    xt: &'a Array2<f64>,
    ns: f64,
}

impl BarycentricFit<'_> {
    fn residual(&self, plan: &Array2<f64>) -> Array2<f64> {
        &self.fitted - &(plan.dot(self.xt) * self.ns)
    }
}

impl Objective for BarycentricFit<'_> {
    fn evaluate(&self, plan: &Array2<f64>) -> f64 {
        sq_frobenius(&self.residual(plan))
    }

    fn gradient(&self, plan: &Array2<f64>) -> Array2<f64> {
        self.residual(plan).dot(&self.xt.t()) * (-2.0 * self.ns)
    }
}

fn check_samples(xs: &Array2<f64>, xt: &Array2<f64>, cfg: &JointMappingConfig) -> Result<()> {
    if xs.nrows() == 0 || xs.ncols() == 0 {
        return Err(Error::EmptyInput("source samples"));
    }
    if xt.nrows() == 0 {
        return Err(Error::EmptyInput("target samples"));
    }
    if xs.ncols() != xt.ncols() {
        return Err(Error::DimensionMismatch(xs.ncols(), xt.ncols()));
    }
    if cfg.mu <= 0.0 || !cfg.mu.is_finite() {
        return Err(Error::InvalidRegularization(cfg.mu));
    }
    if cfg.eta <= 0.0 || !cfg.eta.is_finite() {
        return Err(Error::InvalidPenalty(cfg.eta));
    }
    Ok(())
}

fn block_coordinate_descent<P: MappingProblem>(
    problem: &P,
    xs: &Array2<f64>,
    xt: &Array2<f64>,
    cfg: &JointMappingConfig,
) -> Result<(Array2<f64>, Array2<f64>, Option<BcdLog>)> {
    let ns = xs.nrows() as f64;
    let (a, b): (Array1<f64>, Array1<f64>) = (unif(xs.nrows()), unif(xt.nrows()));
    let cost = dist(xs, xt, Metric::SqEuclidean)? * ns;
    let phi = problem.features();

    let loss = |l: &Array2<f64>, g: &Array2<f64>| {
        let residual = phi.dot(l) - g.dot(xt) * ns;
        sq_frobenius(&residual) + cfg.mu * frobenius(g, &cost) + cfg.eta * problem.regularizer(l)
    };

    let (mut coupling, initial) = emd(&a, &b, &cost, DEFAULT_EMD_MAX_ITER)?;
    let mut mapping = problem.solve(&(coupling.dot(xt) * ns))?;
    let mut value = loss(&mapping, &coupling);
    report_progress(cfg.verbose, 0, value, 0.0);

    let mut log = BcdLog {
        loss: vec![value],
        iterations: 0,
        converged: false,
        initial,
        inner: Vec::new(),
    };
    let cg_cfg = CgConfig {
        max_iter: cfg.inner_max_iter,
        stop_thr: cfg.inner_stop_thr,
        log: cfg.log,
        ..CgConfig::default()
    };

    for it in 1..=cfg.max_iter {
        let fit = BarycentricFit {
            fitted: phi.dot(&mapping),
            xt,
            ns,
        };
        let (next, inner) = cg(&a, &b, &cost, 1.0 / cfg.mu, &fit, Some(&coupling), &cg_cfg)?;
        coupling = next;
        mapping = problem.solve(&(coupling.dot(xt) * ns))?;
        log.inner.extend(inner);

        let next_value = loss(&mapping, &coupling);
        let delta = relative_change(value, next_value);
        value = next_value;
        log.loss.push(value);
        log.iterations = it;
        report_progress(cfg.verbose, it, value, delta);

        if delta < cfg.stop_thr {
            log.converged = true;
            break;
        }
    }

    Ok((coupling, mapping, cfg.log.then_some(log)))
}

/// Jointly estimate a coupling and a linear (affine with `bias`) map from `xs` to `xt`.
///
/// `R(L) = ‖L − I‖²` (the bias row unpenalized): large `eta` pulls the map toward the
/// identity.
///
/// # Errors
///
/// Empty samples, feature dimension mismatch, `mu`/`eta` not positive and finite,
/// singular normal equations.
///
/// # Example
///
/// ```rust
/// use ndarray::array;
/// use otda::mapping::{joint_mapping_linear, JointMappingConfig};
///
/// let xs = array![[0.0], [1.0], [2.0]];
/// let xt = array![[5.0], [6.0], [7.0]];
/// let cfg = JointMappingConfig { bias: true, ..JointMappingConfig::default() };
///
/// let fit = joint_mapping_linear(&xs, &xt, &cfg).unwrap();
/// let moved = fit.mapping.transform(&array![[1.5]]).unwrap();
/// assert!((moved[[0, 0]] - 6.5).abs() < 1e-2);
/// ```
pub fn joint_mapping_linear(
    xs: &Array2<f64>,
    xt: &Array2<f64>,
    cfg: &JointMappingConfig,
) -> Result<JointMapping<LinearMapping>> {
    check_samples(xs, xt, cfg)?;
    let problem = LinearProblem::new(xs, cfg.eta, cfg.bias)?;
    let (coupling, matrix, log) = block_coordinate_descent(&problem, xs, xt, cfg)?;
    Ok(JointMapping {
        coupling,
        mapping: LinearMapping {
            matrix,
            bias: cfg.bias,
        },
        log,
    })
}

/// Jointly estimate a coupling and a kernel map from `xs` to `xt`.
///
/// The map is `x ↦ Σ_i k(x, xs_i)·L_i (+ bias)`, regularized by its RKHS norm
/// `tr(Lᵀ K L)`.
///
/// # Errors
///
/// Empty samples, feature dimension mismatch, `mu`/`eta` not positive and finite,
/// invalid kernel bandwidth, singular normal equations.
pub fn joint_mapping_kernel(
    xs: &Array2<f64>,
    xt: &Array2<f64>,
    kern: Kernel,
    cfg: &JointMappingConfig,
) -> Result<JointMapping<KernelMapping>> {
    check_samples(xs, xt, cfg)?;
    let gram = kernel(xs, xs, kern)?;
    let problem = KernelProblem::new(gram, cfg.eta, cfg.bias)?;
    let (coupling, matrix, log) = block_coordinate_descent(&problem, xs, xt, cfg)?;
    Ok(JointMapping {
        coupling,
        mapping: KernelMapping {
            matrix,
            support: xs.to_owned(),
            kernel: kern,
            bias: cfg.bias,
        },
        log,
    })
}
