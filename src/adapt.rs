//! Fit a coupling between two sample sets and transport samples across it.
//!
//! [`DomainTransport`] is the end-to-end path: ground cost from the samples,
//! optional rescaling, optional label masking, uniform weights, then a coupling
//! from one of the solvers in this crate. Once fitted, source samples are moved
//! by barycentric mapping (`γ Xt` with rows of `γ` normalized), and unseen points
//! by displacing them with their nearest training sample.

use crate::cost::{dist, normalize_cost, unif, CostNormalization, Metric};
use crate::emd::{emd, DEFAULT_EMD_MAX_ITER};
use crate::group::{sinkhorn_l1l2_gl, sinkhorn_lpl1_mm, ClassGroups, GroupConfig, UNLABELED};
use crate::{sinkhorn, Error, Result};
use log::{debug, warn};
use ndarray::{Array2, Axis};

/// Solver producing the coupling in [`DomainTransport::fit`].
#[derive(Debug, Clone)]
pub enum CouplingMethod {
    /// Exact OT.
    Exact,
    /// Entropic OT.
    Sinkhorn { reg: f64 },
    /// Entropic OT with Lp-L1 class sparsity (needs source labels).
    Lpl1 { reg: f64, config: GroupConfig },
    /// Entropic OT with L1-L2 group lasso (needs source labels).
    L1l2 { reg: f64, config: GroupConfig },
}

/// Cost construction and subsolver budgets for [`DomainTransport::fit`].
#[derive(Debug, Clone)]
pub struct AdaptConfig {
    pub metric: Metric,
    pub normalization: Option<CostNormalization>,
    /// Cost given to cross-class pairs when both label sets are provided.
    /// A finite value is relative to the largest cost entry.
    pub limit_max: f64,
    pub sinkhorn_max_iter: usize,
    pub sinkhorn_stop_thr: f64,
    pub emd_max_iter: usize,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self {
            metric: Metric::SqEuclidean,
            normalization: None,
            limit_max: f64::INFINITY,
            sinkhorn_max_iter: 1000,
            sinkhorn_stop_thr: 1e-9,
            emd_max_iter: DEFAULT_EMD_MAX_ITER,
        }
    }
}

/// Which way [`DomainTransport::predict`] moves points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SourceToTarget,
    TargetToSource,
}

/// A fitted coupling between source and target samples.
#[derive(Debug, Clone)]
pub struct DomainTransport {
    xs: Array2<f64>,
    xt: Array2<f64>,
    cost: Array2<f64>,
    coupling: Array2<f64>,
}

impl DomainTransport {
    /// Fit a coupling between `xs` and `xt`.
    ///
    /// `ys` labels every source row; `yt` labels the first target rows. When both are
    /// given, source/target pairs of different classes get cost `limit_max` (source
    /// rows labeled [`UNLABELED`] are left alone). The group methods need `ys`.
    ///
    /// # Errors
    ///
    /// Empty samples, dimension mismatch, inconsistent labels, and any error of the
    /// selected solver.
    pub fn fit(
        xs: &Array2<f64>,
        ys: Option<&[i64]>,
        xt: &Array2<f64>,
        yt: Option<&[i64]>,
        method: &CouplingMethod,
        cfg: &AdaptConfig,
    ) -> Result<Self> {
        if xs.nrows() == 0 {
            return Err(Error::EmptyInput("source samples"));
        }
        if xt.nrows() == 0 {
            return Err(Error::EmptyInput("target samples"));
        }
        if let Some(ys) = ys {
            if ys.len() != xs.nrows() {
                return Err(Error::LengthMismatch(xs.nrows(), ys.len()));
            }
        }

        let mut cost = dist(xs, xt, cfg.metric)?;
        if let Some(norm) = cfg.normalization {
            cost = normalize_cost(&cost, norm);
        }
        if let (Some(ys), Some(yt)) = (ys, yt) {
            cost = mask_cost_by_labels(&cost, ys, yt, cfg.limit_max)?;
        }

        let (a, b) = (unif(xs.nrows()), unif(xt.nrows()));
        let coupling = match method {
            CouplingMethod::Exact => {
                let (plan, log) = emd(&a, &b, &cost, cfg.emd_max_iter)?;
                debug!("exact coupling: {} pivots, cost {:e}", log.iterations, log.cost);
                plan
            }
            CouplingMethod::Sinkhorn { reg } => {
                let (plan, log) = sinkhorn(&a, &b, &cost, *reg, cfg.sinkhorn_max_iter, cfg.sinkhorn_stop_thr)?;
                if !log.converged {
                    warn!(
                        "sinkhorn stopped after {} iterations (marginal error {:e})",
                        log.iterations, log.marginal_error
                    );
                }
                plan
            }
            CouplingMethod::Lpl1 { reg, config } => {
                let ys = ys.ok_or(Error::InvalidLabels("Lp-L1 coupling needs source labels"))?;
                sinkhorn_lpl1_mm(&a, ys, &b, &cost, *reg, config)?.0
            }
            CouplingMethod::L1l2 { reg, config } => {
                let ys = ys.ok_or(Error::InvalidLabels("L1-L2 coupling needs source labels"))?;
                sinkhorn_l1l2_gl(&a, ys, &b, &cost, *reg, config)?.0
            }
        };

        Ok(Self {
            xs: xs.to_owned(),
            xt: xt.to_owned(),
            cost,
            coupling,
        })
    }

    /// The fitted coupling `γ`, `(ns, nt)`.
    pub fn coupling(&self) -> &Array2<f64> {
        &self.coupling
    }

    /// The cost the coupling was fitted on (after rescaling and masking).
    pub fn cost(&self) -> &Array2<f64> {
        &self.cost
    }

    /// Source samples moved onto the target domain.
    pub fn transform(&self) -> Array2<f64> {
        barycentric_map(&self.coupling, &self.xt)
    }

    /// Target samples moved onto the source domain.
    pub fn inverse_transform(&self) -> Array2<f64> {
        barycentric_map(&self.coupling.t().to_owned(), &self.xs)
    }

    /// Move arbitrary points: each point `x` is displaced like its nearest training
    /// sample `x0` of the starting domain, `bary(x0) + (x − x0)`.
    ///
    /// # Errors
    ///
    /// `x` of the wrong feature dimension.
    pub fn predict(&self, x: &Array2<f64>, direction: Direction) -> Result<Array2<f64>> {
        let (support, moved) = match direction {
            Direction::SourceToTarget => (&self.xs, self.transform()),
            Direction::TargetToSource => (&self.xt, self.inverse_transform()),
        };
        let nearest = dist(x, support, Metric::SqEuclidean)?;

        let mut out = x.to_owned();
        for (i, row) in nearest.outer_iter().enumerate() {
            let mut k = 0;
            for (j, &d) in row.iter().enumerate() {
                if d < row[k] {
                    k = j;
                }
            }
            let shift = &moved.row(k) - &support.row(k);
            out.row_mut(i).scaled_add(1.0, &shift);
        }
        Ok(out)
    }
}

/// Barycentric mapping `diag(γ1)⁻¹ γ X`: each row of `coupling` averages the rows of
/// `support`. Rows with no mass (or non-finite weights) map to zero.
pub fn barycentric_map(coupling: &Array2<f64>, support: &Array2<f64>) -> Array2<f64> {
    let mass = coupling.sum_axis(Axis(1));
    let mut weights = coupling.to_owned();
    for (mut row, &m) in weights.outer_iter_mut().zip(mass.iter()) {
        row.mapv_inplace(|p| {
            let w = p / m;
            if w.is_finite() {
                w
            } else {
                0.0
            }
        });
    }
    weights.dot(support)
}

/// Copy of `cost` where every labeled source sample of class `c' ≠ c` paired with a
/// target sample of class `c` costs `limit_max`.
///
/// `yt` labels the first `yt.len()` target columns. Source rows labeled
/// [`UNLABELED`] are never masked. A finite `limit_max` is scaled by the largest
/// cost entry.
///
/// # Errors
///
/// `ys` not of length `cost.nrows()`, `yt` longer than `cost.ncols()`.
pub fn mask_cost_by_labels(
    cost: &Array2<f64>,
    ys: &[i64],
    yt: &[i64],
    limit_max: f64,
) -> Result<Array2<f64>> {
    if ys.len() != cost.nrows() {
        return Err(Error::LengthMismatch(cost.nrows(), ys.len()));
    }
    if yt.len() > cost.ncols() {
        return Err(Error::InvalidLabels("more target labels than target samples"));
    }
    let limit = if limit_max.is_finite() {
        limit_max * cost.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    } else {
        limit_max
    };

    let groups = ClassGroups::from_labels_excluding(ys, UNLABELED)?;
    let mut masked = cost.to_owned();
    for (j, &class) in yt.iter().enumerate() {
        // A target class no source sample carries constrains nothing.
        if groups.indices(class).is_none() {
            continue;
        }
        for (_, rows) in groups.iter().filter(|&(other, _)| other != class) {
            for &i in rows {
                masked[[i, j]] = limit;
            }
        }
    }
    Ok(masked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn shifted() -> (Array2<f64>, Array2<f64>) {
        let xs = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let xt = &xs + 0.5;
        (xs, xt)
    }

    #[test]
    fn exact_transform_recovers_shift() {
        let (xs, xt) = shifted();
        let da = DomainTransport::fit(&xs, None, &xt, None, &CouplingMethod::Exact, &AdaptConfig::default()).unwrap();
        let moved = da.transform();
        for (m, t) in moved.iter().zip(xt.iter()) {
            assert!((m - t).abs() < 1e-12);
        }
        let back = da.inverse_transform();
        for (m, s) in back.iter().zip(xs.iter()) {
            assert!((m - s).abs() < 1e-12);
        }
    }

    #[test]
    fn predict_on_training_points_matches_transform() {
        let (xs, xt) = shifted();
        let method = CouplingMethod::Sinkhorn { reg: 0.5 };
        let da = DomainTransport::fit(&xs, None, &xt, None, &method, &AdaptConfig::default()).unwrap();
        let predicted = da.predict(&xs, Direction::SourceToTarget).unwrap();
        let moved = da.transform();
        for (p, m) in predicted.iter().zip(moved.iter()) {
            assert!((p - m).abs() < 1e-12);
        }
        let off = da.predict(&array![[0.1, 0.0]], Direction::SourceToTarget).unwrap();
        assert!((off[[0, 0]] - (moved[[0, 0]] + 0.1)).abs() < 1e-12);
        assert!(da.predict(&array![[0.0]], Direction::TargetToSource).is_err());
    }

    #[test]
    fn barycentric_map_zero_fills_empty_rows() {
        let coupling = array![[0.5, 0.5], [0.0, 0.0]];
        let support = array![[2.0], [4.0]];
        let mapped = barycentric_map(&coupling, &support);
        assert_eq!(mapped, array![[3.0], [0.0]]);
    }

    #[test]
    fn masking_touches_only_cross_class_pairs() {
        let cost = Array2::from_elem((4, 3), 1.0);
        let ys = [0, 1, UNLABELED, 0];
        let yt = [1, 0];
        let masked = mask_cost_by_labels(&cost, &ys, &yt, f64::INFINITY).unwrap();
        let expected = array![
            [f64::INFINITY, 1.0, 1.0],
            [1.0, f64::INFINITY, 1.0],
            [1.0, 1.0, 1.0],
            [f64::INFINITY, 1.0, 1.0],
        ];
        assert_eq!(masked, expected);

        let scaled = mask_cost_by_labels(&(&cost * 2.0), &ys, &yt, 10.0).unwrap();
        assert_eq!(scaled[[0, 0]], 20.0);
        assert!(mask_cost_by_labels(&cost, &ys, &[0, 0, 0, 0], 1.0).is_err());
    }

    #[test]
    fn masking_skips_target_classes_absent_from_source() {
        let cost = Array2::from_elem((3, 3), 1.0);
        let ys = [0, 1, UNLABELED];
        let yt = [7, UNLABELED, 1];
        let masked = mask_cost_by_labels(&cost, &ys, &yt, f64::INFINITY).unwrap();
        let expected = array![
            [1.0, 1.0, f64::INFINITY],
            [1.0, 1.0, 1.0],
            [1.0, 1.0, 1.0],
        ];
        assert_eq!(masked, expected);
    }

    #[test]
    fn masked_exact_coupling_respects_labels() {
        let (xs, xt) = shifted();
        let ys = [0, 1, 0, 1];
        let yt = [1, 0, 1, 0];
        let da = DomainTransport::fit(
            &xs,
            Some(&ys[..]),
            &xt,
            Some(&yt[..]),
            &CouplingMethod::Exact,
            &AdaptConfig::default(),
        )
        .unwrap();
        for i in 0..4 {
            for j in 0..4 {
                if ys[i] != yt[j] {
                    assert_eq!(da.coupling()[[i, j]], 0.0);
                }
            }
        }
        assert!(da.cost()[[0, 0]].is_infinite());
    }

    #[test]
    fn group_methods_need_source_labels() {
        let (xs, xt) = shifted();
        let method = CouplingMethod::L1l2 {
            reg: 0.5,
            config: GroupConfig::default(),
        };
        assert!(matches!(
            DomainTransport::fit(&xs, None, &xt, None, &method, &AdaptConfig::default()),
            Err(Error::InvalidLabels(_))
        ));
        let ys = [0, 0, 1, 1];
        let method = CouplingMethod::Lpl1 {
            reg: 0.5,
            config: GroupConfig::default(),
        };
        let da = DomainTransport::fit(&xs, Some(&ys[..]), &xt, None, &method, &AdaptConfig::default()).unwrap();
        assert!((da.coupling().sum() - 1.0).abs() < 1e-6);
    }
}
