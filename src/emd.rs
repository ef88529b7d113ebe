//! Exact optimal transport (earth mover's distance) via the transportation simplex.
//!
//! The transport polytope `{P ≥ 0 : P1 = a, Pᵀ1 = b}` has vertices whose support is a
//! spanning tree of the bipartite graph rows × columns (`m + n - 1` basic cells,
//! some possibly carrying zero flow). The simplex walks between such trees:
//!
//! 1. north-west-corner rule for an initial tree;
//! 2. dual potentials `u_i + v_j = C_ij` on the tree cells;
//! 3. entering cell = most negative reduced cost `C_ij - u_i - v_j` (Dantzig);
//! 4. the entering cell closes a cycle with the tree path between its row and column;
//!    flow is shifted around the cycle until a cell empties and leaves.
//!
//! Cost is `O(mn)` per pivot for pricing; the tree work is `O(m + n)`.
//!
//! Infinite cost entries are forbidden cells: they are priced with a penalty far above
//! every finite cost, so they only carry mass when no other plan is feasible.

use crate::{check_cost, check_marginals, frobenius, Error, Result};
use log::warn;
use ndarray::{Array1, Array2};

/// Default pivot budget for [`emd`].
pub const DEFAULT_EMD_MAX_ITER: usize = 100_000;

/// Penalty multiplier applied to the largest finite cost for `+∞` entries.
const FORBIDDEN_SCALE: f64 = 1e6;

/// Diagnostics of one [`emd`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmdLog {
    /// Simplex pivots performed.
    pub iterations: usize,
    /// Transport cost `<P, C>` of the returned plan.
    pub cost: f64,
    /// `false` when the pivot budget ran out before optimality.
    pub converged: bool,
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    row: usize,
    col: usize,
    flow: f64,
}

/// Solve the exact (unregularized) transport problem.
///
/// Returns a plan whose row sums equal `a` and column sums equal `b` (up to rounding)
/// and which minimizes `<P, C>`.
///
/// # Errors
///
/// Shape mismatch, empty or negative marginals, totals that differ (infeasible),
/// NaN costs, `-∞` costs.
///
/// # Example
///
/// ```rust
/// use ndarray::array;
/// use otda::emd::{emd, DEFAULT_EMD_MAX_ITER};
///
/// let a = array![0.5, 0.5];
/// let b = array![0.5, 0.5];
/// let cost = array![[0.0, 1.0], [1.0, 0.0]];
///
/// let (plan, log) = emd(&a, &b, &cost, DEFAULT_EMD_MAX_ITER).unwrap();
/// assert!(log.converged);
/// assert!((plan[[0, 0]] - 0.5).abs() < 1e-12);
/// assert!(log.cost.abs() < 1e-12);
/// ```
pub fn emd(
    a: &Array1<f64>,
    b: &Array1<f64>,
    cost: &Array2<f64>,
    max_iter: usize,
) -> Result<(Array2<f64>, EmdLog)> {
    let m = a.len();
    let n = b.len();
    check_marginals(a, b)?;
    check_cost(cost, m, n)?;
    if cost.iter().any(|&c| c.is_nan() || c == f64::NEG_INFINITY) {
        return Err(Error::Domain("emd cost entries must be finite or +inf"));
    }

    let max_finite = cost
        .iter()
        .filter(|c| c.is_finite())
        .fold(0.0f64, |acc, &c| acc.max(c.abs()));
    let forbidden = FORBIDDEN_SCALE * (1.0 + max_finite);
    let priced = cost.mapv(|c| if c.is_finite() { c } else { forbidden });
    let threshold = -1e-10 * (1.0 + max_finite);

    let mut basis = north_west_corner(a, b);
    let mut log = EmdLog::default();

    loop {
        let adjacency = tree_adjacency(&basis, m, n);
        let (u, v) = potentials(&basis, &adjacency, &priced, m);

        let mut entering = None;
        let mut best = threshold;
        for i in 0..m {
            for j in 0..n {
                let reduced = priced[[i, j]] - u[i] - v[j];
                if reduced < best {
                    best = reduced;
                    entering = Some((i, j));
                }
            }
        }
        let Some((row, col)) = entering else {
            log.converged = true;
            break;
        };
        if log.iterations >= max_iter {
            warn!(
                "emd: pivot budget {} exhausted (best reduced cost {:e})",
                max_iter, best
            );
            break;
        }

        let path = tree_path(&basis, &adjacency, row, m + col)
            .ok_or(Error::Domain("emd basis is not a spanning tree"))?;
        pivot(&mut basis, &path, row, col);
        log.iterations += 1;
    }

    let mut plan = Array2::zeros((m, n));
    for cell in &basis {
        plan[[cell.row, cell.col]] += cell.flow;
    }
    log.cost = frobenius(&plan, cost);
    Ok((plan, log))
}

/// Initial basic feasible solution: a staircase from (0, 0) to (m-1, n-1).
///
/// Always emits exactly `m + n - 1` cells, so ties between exhausted supply and
/// demand leave a zero-flow cell that keeps the tree connected.
fn north_west_corner(a: &Array1<f64>, b: &Array1<f64>) -> Vec<Cell> {
    let (m, n) = (a.len(), b.len());
    let mut supply = a.to_vec();
    let mut demand = b.to_vec();
    let mut cells = Vec::with_capacity(m + n - 1);
    let (mut i, mut j) = (0, 0);
    loop {
        let flow = supply[i].min(demand[j]).max(0.0);
        supply[i] -= flow;
        demand[j] -= flow;
        cells.push(Cell { row: i, col: j, flow });
        if i + 1 == m && j + 1 == n {
            break;
        }
        if i + 1 == m {
            j += 1;
        } else if j + 1 == n || supply[i] <= demand[j] {
            i += 1;
        } else {
            j += 1;
        }
    }
    cells
}

/// Node ids: rows are `0..m`, columns are `m..m+n`. Edges carry the basis cell index.
fn tree_adjacency(basis: &[Cell], m: usize, n: usize) -> Vec<Vec<(usize, usize)>> {
    let mut adjacency = vec![Vec::new(); m + n];
    for (k, cell) in basis.iter().enumerate() {
        adjacency[cell.row].push((m + cell.col, k));
        adjacency[m + cell.col].push((cell.row, k));
    }
    adjacency
}

fn potentials(
    basis: &[Cell],
    adjacency: &[Vec<(usize, usize)>],
    cost: &Array2<f64>,
    m: usize,
) -> (Array1<f64>, Array1<f64>) {
    let n = adjacency.len() - m;
    let mut u = Array1::zeros(m);
    let mut v = Array1::zeros(n);
    let mut known = vec![false; m + n];
    known[0] = true;
    let mut stack = vec![0usize];
    while let Some(node) = stack.pop() {
        for &(next, k) in &adjacency[node] {
            if known[next] {
                continue;
            }
            let c = cost[[basis[k].row, basis[k].col]];
            if next < m {
                u[next] = c - v[node - m];
            } else {
                v[next - m] = c - u[node];
            }
            known[next] = true;
            stack.push(next);
        }
    }
    (u, v)
}

/// Basis cells on the tree path from node `from` to node `to`, in walking order.
fn tree_path(
    basis: &[Cell],
    adjacency: &[Vec<(usize, usize)>],
    from: usize,
    to: usize,
) -> Option<Vec<usize>> {
    let mut parent: Vec<Option<(usize, usize)>> = vec![None; adjacency.len()];
    let mut visited = vec![false; adjacency.len()];
    visited[from] = true;
    let mut queue = std::collections::VecDeque::from([from]);
    while let Some(node) = queue.pop_front() {
        if node == to {
            break;
        }
        for &(next, k) in &adjacency[node] {
            if !visited[next] {
                visited[next] = true;
                parent[next] = Some((node, k));
                queue.push_back(next);
            }
        }
    }
    if !visited[to] {
        return None;
    }

    let mut path = Vec::new();
    let mut node = to;
    while node != from {
        let (prev, k) = parent[node]?;
        path.push(k);
        node = prev;
    }
    path.reverse();
    debug_assert!(path.len() <= basis.len());
    Some(path)
}

/// Shift flow around the cycle closed by the entering cell `(row, col)`.
///
/// The path runs row → column → row → … → column, so it has odd length and its cells
/// alternate `-`, `+`, …, `-`. The first cell reaching the minimal `-` flow leaves.
fn pivot(basis: &mut [Cell], path: &[usize], row: usize, col: usize) {
    let mut leaving = path[0];
    let mut theta = f64::INFINITY;
    for &k in path.iter().step_by(2) {
        if basis[k].flow < theta {
            theta = basis[k].flow;
            leaving = k;
        }
    }
    let theta = theta.max(0.0);
    for (t, &k) in path.iter().enumerate() {
        if t % 2 == 0 {
            basis[k].flow = (basis[k].flow - theta).max(0.0);
        } else {
            basis[k].flow += theta;
        }
    }
    basis[leaving] = Cell {
        row,
        col,
        flow: theta,
    };
}
