//! Class-based group regularization of the coupling.
//!
//! With labeled source samples, a good adaptation plan feeds each target sample
//! from a single source class. Two penalties encourage that block sparsity:
//!
//! - **Lp-L1** (`p = 1/2`): `Σ_j Σ_c (Σ_{i∈c} γ_ij)^p`, non-convex; solved by
//!   majorize-minimize, each round an entropic OT with reweighted costs
//!   ([`sinkhorn_lpl1_mm`]).
//! - **L1-L2** (group lasso): `Σ_j Σ_c ‖γ_{c,j}‖₂`, convex; solved by the
//!   generalized conditional gradient ([`sinkhorn_l1l2_gl`]).
//!
//! # References
//!
//! - Courty, Flamary, Tuia (2014). "Domain adaptation with regularized optimal transport"
//! - Courty, Flamary, Tuia, Rakotomamonjy (2017). "Optimal Transport for Domain Adaptation"

use crate::optim::{gcg, CgConfig, CgLog, Objective};
use crate::{
    check_cost, check_marginals, frobenius, neg_entropy, relative_change, report_progress,
    sinkhorn, Error, Result, SinkhornLog,
};
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// Label marking a source sample as unlabeled (semi-supervised masking).
pub const UNLABELED: i64 = -1;

/// Exponent of the Lp-L1 penalty.
const LPL1_P: f64 = 0.5;
/// Smoothing of the Lp-L1 majorizer at zero mass.
const LPL1_EPS: f64 = 1e-3;

/// Source row indices grouped by class label, classes in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassGroups {
    groups: Vec<(i64, Vec<usize>)>,
}

impl ClassGroups {
    /// Group every index of `labels` by its label.
    ///
    /// # Errors
    ///
    /// `labels` empty.
    pub fn from_labels(labels: &[i64]) -> Result<Self> {
        Self::build(labels, None)
    }

    /// Group the indices of `labels`, leaving out those labeled `sentinel`.
    ///
    /// # Errors
    ///
    /// `labels` empty.
    pub fn from_labels_excluding(labels: &[i64], sentinel: i64) -> Result<Self> {
        Self::build(labels, Some(sentinel))
    }

    fn build(labels: &[i64], sentinel: Option<i64>) -> Result<Self> {
        if labels.is_empty() {
            return Err(Error::EmptyInput("labels"));
        }
        let mut by_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            if Some(label) == sentinel {
                continue;
            }
            by_class.entry(label).or_default().push(i);
        }
        Ok(Self {
            groups: by_class.into_iter().collect(),
        })
    }

    /// `(label, indices)` pairs, labels ascending, indices ascending.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &[usize])> + '_ {
        self.groups.iter().map(|(c, idx)| (*c, idx.as_slice()))
    }

    /// Indices labeled `class`, if any.
    pub fn indices(&self, class: i64) -> Option<&[usize]> {
        self.groups
            .binary_search_by_key(&class, |(c, _)| *c)
            .ok()
            .map(|k| self.groups[k].1.as_slice())
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// `true` when no sample carries a class label.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Configuration for [`sinkhorn_lpl1_mm`] and [`sinkhorn_l1l2_gl`].
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Weight of the group penalty.
    pub eta: f64,
    /// Outer iterations (always all of them for Lp-L1).
    pub max_iter: usize,
    /// Iteration budget of each inner Sinkhorn solve.
    pub inner_max_iter: usize,
    /// Marginal tolerance of each inner Sinkhorn solve.
    pub inner_stop_thr: f64,
    /// Relative-decrease threshold of the L1-L2 outer loop.
    pub stop_thr: f64,
    /// Emit the progress table through `log::info!`.
    pub verbose: bool,
    /// Return the solver log.
    pub log: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            eta: 0.1,
            max_iter: 10,
            inner_max_iter: 200,
            inner_stop_thr: 1e-9,
            stop_thr: 1e-9,
            verbose: false,
            log: false,
        }
    }
}

/// Diagnostics of [`sinkhorn_lpl1_mm`].
#[derive(Debug, Clone, Default)]
pub struct MajorizeLog {
    /// Lp-L1 objective of the plan after each outer iteration.
    pub loss: Vec<f64>,
    /// Outer iterations run (always `max_iter`).
    pub iterations: usize,
    /// Inner Sinkhorn logs, one per outer iteration.
    pub inner: Vec<SinkhornLog>,
}

fn check_group_inputs(
    a: &Array1<f64>,
    labels_a: &[i64],
    b: &Array1<f64>,
    cost: &Array2<f64>,
    reg: f64,
    eta: f64,
) -> Result<ClassGroups> {
    check_marginals(a, b)?;
    check_cost(cost, a.len(), b.len())?;
    if labels_a.len() != a.len() {
        return Err(Error::LengthMismatch(a.len(), labels_a.len()));
    }
    if reg <= 0.0 || !reg.is_finite() {
        return Err(Error::InvalidRegularization(reg));
    }
    if eta <= 0.0 || !eta.is_finite() {
        return Err(Error::InvalidPenalty(eta));
    }
    ClassGroups::from_labels(labels_a)
}

/// Per-class column masses `m_j = Σ_{i∈c} γ_ij`.
fn class_column_mass(plan: &Array2<f64>, rows: &[usize]) -> Array1<f64> {
    let mut mass = Array1::zeros(plan.ncols());
    for &i in rows {
        mass += &plan.row(i);
    }
    mass
}

/// Majorizer weights `p·(m_j + ε)^(p-1)` broadcast on the rows of each class.
///
/// Rows outside every class keep weight 1.
pub(crate) fn majorizer_weights(plan: &Array2<f64>, groups: &ClassGroups) -> Array2<f64> {
    let mut w = Array2::ones(plan.dim());
    for (_, rows) in groups.iter() {
        let weights = class_column_mass(plan, rows).mapv(|m| LPL1_P * (m + LPL1_EPS).powf(LPL1_P - 1.0));
        for &i in rows {
            w.row_mut(i).assign(&weights);
        }
    }
    w
}

fn lpl1_penalty(plan: &Array2<f64>, groups: &ClassGroups) -> f64 {
    groups
        .iter()
        .map(|(_, rows)| {
            class_column_mass(plan, rows)
                .iter()
                .map(|&m| (m + LPL1_EPS).powf(LPL1_P))
                .sum::<f64>()
        })
        .sum()
}

/// Entropic OT with a non-convex Lp-L1 class-sparsity penalty.
///
/// Majorize-minimize: starting from `W = 0`, each of the `max_iter` rounds solves
/// `sinkhorn(a, b, M + eta·W, reg)` and rebuilds `W` from the per-class column
/// masses of the new plan. There is no early stop: the penalty has no monotone
/// descent guarantee to test against.
///
/// # Errors
///
/// Invalid marginals or cost shape, `labels_a` not of length `a.len()`, `reg`/`eta`
/// not positive and finite, `max_iter == 0`.
///
/// # Example
///
/// ```rust
/// use ndarray::array;
/// use otda::group::{sinkhorn_lpl1_mm, GroupConfig};
///
/// let a = array![0.25, 0.25, 0.25, 0.25];
/// let labels = [0, 0, 1, 1];
/// let b = array![0.5, 0.5];
/// let cost = array![[0.0, 1.0], [0.1, 1.0], [1.0, 0.0], [1.0, 0.1]];
///
/// let (plan, _) = sinkhorn_lpl1_mm(&a, &labels, &b, &cost, 0.1, &GroupConfig::default()).unwrap();
/// assert!(plan[[0, 0]] > plan[[0, 1]]);
/// ```
pub fn sinkhorn_lpl1_mm(
    a: &Array1<f64>,
    labels_a: &[i64],
    b: &Array1<f64>,
    cost: &Array2<f64>,
    reg: f64,
    cfg: &GroupConfig,
) -> Result<(Array2<f64>, Option<MajorizeLog>)> {
    let groups = check_group_inputs(a, labels_a, b, cost, reg, cfg.eta)?;
    if cfg.max_iter == 0 {
        return Err(Error::Domain("majorize-minimize requires max_iter >= 1"));
    }

    let mut log = MajorizeLog::default();
    let mut weights = Array2::zeros(cost.dim());
    let mut plan = Array2::zeros(cost.dim());
    let mut prev = f64::NAN;

    for it in 0..cfg.max_iter {
        let reweighted = cost + &(&weights * cfg.eta);
        let (next, inner) = sinkhorn(a, b, &reweighted, reg, cfg.inner_max_iter, cfg.inner_stop_thr)?;
        plan = next;
        weights = majorizer_weights(&plan, &groups);

        let loss = frobenius(&plan, cost) + reg * neg_entropy(&plan) + cfg.eta * lpl1_penalty(&plan, &groups);
        let delta = if it == 0 { 0.0 } else { relative_change(prev, loss) };
        report_progress(cfg.verbose, it, loss, delta);
        prev = loss;

        log.loss.push(loss);
        log.inner.push(inner);
        log.iterations = it + 1;
    }

    Ok((plan, cfg.log.then_some(log)))
}

/// L1-L2 group-lasso penalty `f(γ) = Σ_j Σ_c ‖γ_{c,j}‖₂`.
///
/// The gradient is the normalized class sub-column, and zero where that sub-column
/// is identically zero.
#[derive(Debug, Clone, Copy)]
pub struct GroupLasso<'a> {
    groups: &'a ClassGroups,
}

impl<'a> GroupLasso<'a> {
    /// Penalty over the source classes in `groups`.
    pub fn new(groups: &'a ClassGroups) -> Self {
        Self { groups }
    }

    fn column_norm(plan: &Array2<f64>, rows: &[usize], j: usize) -> f64 {
        rows.iter().map(|&i| plan[[i, j]] * plan[[i, j]]).sum::<f64>().sqrt()
    }
}

impl Objective for GroupLasso<'_> {
    fn evaluate(&self, plan: &Array2<f64>) -> f64 {
        let mut total = 0.0;
        for (_, rows) in self.groups.iter() {
            for j in 0..plan.ncols() {
                total += Self::column_norm(plan, rows, j);
            }
        }
        total
    }

    fn gradient(&self, plan: &Array2<f64>) -> Array2<f64> {
        let mut grad = Array2::zeros(plan.dim());
        for (_, rows) in self.groups.iter() {
            for j in 0..plan.ncols() {
                let norm = Self::column_norm(plan, rows, j);
                if norm > 0.0 {
                    for &i in rows {
                        grad[[i, j]] = plan[[i, j]] / norm;
                    }
                }
            }
        }
        grad
    }
}

/// Entropic OT with an L1-L2 group-lasso class penalty, solved by [`gcg`].
///
/// Minimizes `<γ,M> + reg·Σγlogγ + eta·Σ_j Σ_c ‖γ_{c,j}‖₂`. Stops on relative
/// decrease below `stop_thr` or after `max_iter` outer steps.
///
/// # Errors
///
/// Invalid marginals or cost shape, `labels_a` not of length `a.len()`, `reg`/`eta`
/// not positive and finite.
pub fn sinkhorn_l1l2_gl(
    a: &Array1<f64>,
    labels_a: &[i64],
    b: &Array1<f64>,
    cost: &Array2<f64>,
    reg: f64,
    cfg: &GroupConfig,
) -> Result<(Array2<f64>, Option<CgLog>)> {
    let groups = check_group_inputs(a, labels_a, b, cost, reg, cfg.eta)?;
    let penalty = GroupLasso::new(&groups);
    let cg_cfg = CgConfig {
        max_iter: cfg.max_iter,
        stop_thr: cfg.stop_thr,
        inner_max_iter: cfg.inner_max_iter,
        inner_stop_thr: cfg.inner_stop_thr,
        verbose: cfg.verbose,
        log: cfg.log,
    };
    gcg(a, b, cost, reg, cfg.eta, &penalty, None, &cg_cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    fn two_class_problem() -> (Array1<f64>, Vec<i64>, Array1<f64>, Array2<f64>) {
        let xs: [f64; 6] = [0.0, 0.2, 0.4, 3.0, 3.2, 3.4];
        let xt = [1.0, 1.2, 2.0, 2.2];
        let labels = vec![0, 0, 0, 1, 1, 1];
        let cost = Array2::from_shape_fn((6, 4), |(i, j)| (xs[i] - xt[j]).powi(2));
        (Array1::from_elem(6, 1.0 / 6.0), labels, Array1::from_elem(4, 0.25), cost)
    }

    #[test]
    fn groups_sorted_and_sentinel_excluded() {
        let labels = [2, -1, 0, 2, 0, -1];
        let all = ClassGroups::from_labels(&labels).unwrap();
        assert_eq!(all.iter().map(|(c, _)| c).collect::<Vec<_>>(), vec![-1, 0, 2]);
        assert_eq!(all.indices(2), Some(&[0usize, 3][..]));

        let labeled = ClassGroups::from_labels_excluding(&labels, UNLABELED).unwrap();
        assert_eq!(labeled.len(), 2);
        assert_eq!(labeled.indices(UNLABELED), None);
        assert_eq!(labeled.indices(0), Some(&[2usize, 4][..]));

        assert!(matches!(ClassGroups::from_labels(&[]), Err(Error::EmptyInput(_))));
    }

    #[test]
    fn single_class_first_round_is_plain_sinkhorn() {
        let (a, _, b, cost) = two_class_problem();
        let labels = vec![7; 6];
        let cfg = GroupConfig {
            max_iter: 1,
            ..GroupConfig::default()
        };
        let (plan, _) = sinkhorn_lpl1_mm(&a, &labels, &b, &cost, 0.5, &cfg).unwrap();
        let (expected, _) = sinkhorn(&a, &b, &cost, 0.5, cfg.inner_max_iter, cfg.inner_stop_thr).unwrap();
        assert_eq!(plan, expected);
    }

    #[test]
    fn lpl1_runs_full_budget() {
        let (a, labels, b, cost) = two_class_problem();
        let cfg = GroupConfig {
            max_iter: 5,
            stop_thr: 1.0,
            log: true,
            ..GroupConfig::default()
        };
        let (_, log) = sinkhorn_lpl1_mm(&a, &labels, &b, &cost, 0.5, &cfg).unwrap();
        let log = log.unwrap();
        assert_eq!(log.iterations, 5);
        assert_eq!(log.loss.len(), 5);
        assert_eq!(log.inner.len(), 5);
    }

    #[test]
    fn lpl1_rejects_zero_budget_and_bad_labels() {
        let (a, labels, b, cost) = two_class_problem();
        let cfg = GroupConfig {
            max_iter: 0,
            ..GroupConfig::default()
        };
        assert!(matches!(
            sinkhorn_lpl1_mm(&a, &labels, &b, &cost, 0.5, &cfg),
            Err(Error::Domain(_))
        ));
        assert!(matches!(
            sinkhorn_lpl1_mm(&a, &labels[..4], &b, &cost, 0.5, &GroupConfig::default()),
            Err(Error::LengthMismatch(6, 4))
        ));
        assert!(matches!(
            sinkhorn_l1l2_gl(&a, &labels, &b, &cost, 0.0, &GroupConfig::default()),
            Err(Error::InvalidRegularization(_))
        ));
    }

    #[test]
    fn group_lasso_gradient_is_zero_on_empty_blocks() {
        let groups = ClassGroups::from_labels(&[0, 0, 1]).unwrap();
        let penalty = GroupLasso::new(&groups);
        let plan = array![[0.3, 0.0], [0.4, 0.0], [0.0, 0.3]];
        assert!((penalty.evaluate(&plan) - (0.5 + 0.3)).abs() < 1e-12);
        let grad = penalty.gradient(&plan);
        assert!((grad[[0, 0]] - 0.6).abs() < 1e-12);
        assert!((grad[[1, 0]] - 0.8).abs() < 1e-12);
        assert_eq!(grad[[0, 1]], 0.0);
        assert_eq!(grad[[2, 0]], 0.0);
        assert!((grad[[2, 1]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn l1l2_loss_is_non_increasing() {
        let (a, labels, b, cost) = two_class_problem();
        let cfg = GroupConfig {
            eta: 1.0,
            max_iter: 20,
            log: true,
            ..GroupConfig::default()
        };
        let (plan, log) = sinkhorn_l1l2_gl(&a, &labels, &b, &cost, 0.5, &cfg).unwrap();
        let log = log.unwrap();
        for w in log.loss.windows(2) {
            assert!(w[1] <= w[0], "loss increased: {:?}", log.loss);
        }
        assert!(plan.iter().all(|&p| p >= 0.0));
    }

    proptest! {
        #[test]
        fn majorizer_weights_finite_and_nonnegative(
            entries in prop::collection::vec(0.0f64..1.0, 12),
            labels in prop::collection::vec(0i64..3, 4),
        ) {
            let plan = Array2::from_shape_vec((4, 3), entries).unwrap();
            let groups = ClassGroups::from_labels(&labels).unwrap();
            let w = majorizer_weights(&plan, &groups);
            prop_assert!(w.iter().all(|&x| x.is_finite() && x >= 0.0));
        }

        #[test]
        fn groups_partition_labeled_indices(
            labels in prop::collection::vec(-1i64..4, 1..40),
        ) {
            let groups = ClassGroups::from_labels_excluding(&labels, UNLABELED).unwrap();
            let mut seen: Vec<usize> = groups.iter().flat_map(|(_, idx)| idx.iter().copied()).collect();
            seen.sort_unstable();
            let expected: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] != UNLABELED).collect();
            prop_assert_eq!(seen, expected);
            for (class, idx) in groups.iter() {
                prop_assert!(idx.iter().all(|&i| labels[i] == class));
            }
        }
    }
}
