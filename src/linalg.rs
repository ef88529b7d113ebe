//! Dense factorizations for the closed-form mapping updates.
//!
//! Normal equations here are small (`d × d` for linear maps, `ns × ns` for kernel
//! maps) and fixed across block coordinate descent rounds, so each is factored once
//! with `faer` and reused for every right-hand side. Data stays in `ndarray`; the
//! conversion happens at this boundary.

use crate::{Error, Result};
use faer::linalg::solvers::{Llt, PartialPivLu, Solve};
use faer::{Mat, Side};
use ndarray::Array2;

fn to_faer(a: &Array2<f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn from_faer(m: &Mat<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

fn check_square(a: &Array2<f64>) -> Result<usize> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(Error::CostShapeMismatch(n, n, a.nrows(), a.ncols()));
    }
    Ok(n)
}

/// Pivots below `n · ε · max|A|` count as zero.
fn pivot_floor(a: &Array2<f64>) -> f64 {
    let scale = a.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
    (a.nrows() as f64) * f64::EPSILON * scale.max(f64::MIN_POSITIVE)
}

/// A factored square system `A X = B`.
pub(crate) enum Factorization {
    /// Partial-pivoting LU, for systems that are not known to be positive definite.
    Lu(PartialPivLu<f64>),
    /// Cholesky, for symmetric positive definite systems.
    Llt(Llt<f64>),
}

impl Factorization {
    /// LU with partial pivoting.
    ///
    /// # Errors
    ///
    /// `A` not square, or a pivot of `U` below `n · ε · max|A|`.
    pub(crate) fn lu(a: &Array2<f64>) -> Result<Self> {
        let n = check_square(a)?;
        let floor = pivot_floor(a);
        let lu = PartialPivLu::new(to_faer(a).as_ref());
        let u = lu.U();
        for k in 0..n {
            let pivot = u[(k, k)];
            if !(pivot.abs() > floor) {
                return Err(Error::SingularMatrix(pivot, k));
            }
        }
        Ok(Self::Lu(lu))
    }

    /// Cholesky `A = L Lᵀ` from the lower triangle.
    ///
    /// # Errors
    ///
    /// `A` not square, or not numerically positive definite. The reported row is
    /// the smallest diagonal entry.
    pub(crate) fn llt(a: &Array2<f64>) -> Result<Self> {
        let n = check_square(a)?;
        Llt::new(to_faer(a).as_ref(), Side::Lower)
            .map(Self::Llt)
            .map_err(|_| {
                let (row, pivot) = (0..n)
                    .map(|k| (k, a[[k, k]]))
                    .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best });
                Error::SingularMatrix(pivot, row)
            })
    }

    fn order(&self) -> usize {
        match self {
            Self::Lu(lu) => lu.U().nrows(),
            Self::Llt(llt) => llt.L().nrows(),
        }
    }

    /// Solve for every column of `b`.
    ///
    /// # Errors
    ///
    /// `b` has a row count different from the factored system.
    pub(crate) fn solve(&self, b: &Array2<f64>) -> Result<Array2<f64>> {
        let n = self.order();
        if b.nrows() != n {
            return Err(Error::LengthMismatch(n, b.nrows()));
        }
        let mut x = to_faer(b);
        match self {
            Self::Lu(lu) => lu.solve_in_place(x.as_mut()),
            Self::Llt(llt) => llt.solve_in_place(x.as_mut()),
        }
        Ok(from_faer(&x))
    }
}

/// Squared Frobenius norm `Σ x_ij²`.
pub fn sq_frobenius(x: &Array2<f64>) -> f64 {
    x.iter().map(|v| v * v).sum()
}
