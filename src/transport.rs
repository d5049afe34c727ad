/*!
# Exact optimal transport

Computes the exact discrete optimal transport cost between two weighted point
clouds given their ground cost matrix. This is the reference distance: the
Sinkhorn, Hilbert and swap engines all approximate it.

Two exact solvers are used:
- when both marginals are uniform over the same number of points, the problem
  is a linear assignment and is solved with a shortest-augmenting-path Hungarian
  method;
- otherwise the transportation simplex is run from a north-west-corner basis.

The returned distance is `(Σ plan·cost)^(1/p)`.

```rust
use ndarray::arr2;
use winference::cost::CostMatrixBuilder;
use winference::transport::{uniform_weights, ExactTransport};

let a = arr2(&[[0.0], [10.0]]);
let b = arr2(&[[1.0], [9.0]]);
let cost = CostMatrixBuilder::new(1.0).build(a.view(), b.view()).unwrap();
let w = uniform_weights(2);
let solution = ExactTransport::new(1.0)
    .solve(w.view(), w.view(), cost.view())
    .unwrap();
assert!((solution.distance - 1.0).abs() < 1e-12);
```
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{AbcError, Result};

/// Marginal weights must sum to one within this tolerance.
pub const MARGINAL_TOLERANCE: f64 = 1e-8;

/// Uniform weight vector of length `n`.
pub fn uniform_weights(n: usize) -> Array1<f64> {
    Array1::from_elem(n, 1.0 / n as f64)
}

/// Result of an exact transport solve.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSolution {
    /// Optimal coupling, n×m, with the requested marginals.
    pub plan: Array2<f64>,
    /// Σ plan·cost.
    pub cost: f64,
    /// `cost^(1/p)`.
    pub distance: f64,
}

/// Exact transport solver for a fixed exponent `p`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExactTransport {
    pub p: f64,
}

impl ExactTransport {
    pub fn new(p: f64) -> Self {
        Self { p }
    }

    /// Solves the transport problem between marginals `w1` (rows) and `w2` (columns).
    pub fn solve(
        &self,
        w1: ArrayView1<f64>,
        w2: ArrayView1<f64>,
        cost: ArrayView2<f64>,
    ) -> Result<TransportSolution> {
        if !(self.p >= 1.0) {
            return Err(AbcError::config(format!("p must be >= 1, got {}", self.p)));
        }
        check_marginals(w1, w2, cost)?;
        let (n, m) = cost.dim();

        let plan = if n == m && is_uniform(w1) && is_uniform(w2) {
            let perm = assignment(cost)?;
            let mut plan = Array2::<f64>::zeros((n, m));
            for (i, &j) in perm.iter().enumerate() {
                plan[[i, j]] = 1.0 / n as f64;
            }
            plan
        } else {
            transportation_simplex(w1, w2, cost)?
        };

        let total = (&plan * &cost).sum().max(0.0);
        Ok(TransportSolution {
            distance: total.powf(1.0 / self.p),
            cost: total,
            plan,
        })
    }
}

/// Shorthand for `ExactTransport::new(p).solve(w1, w2, cost)`.
pub fn exact_transport(
    w1: ArrayView1<f64>,
    w2: ArrayView1<f64>,
    cost: ArrayView2<f64>,
    p: f64,
) -> Result<TransportSolution> {
    ExactTransport::new(p).solve(w1, w2, cost)
}

/// Validates marginal weights against a cost matrix.
pub(crate) fn check_marginals(
    w1: ArrayView1<f64>,
    w2: ArrayView1<f64>,
    cost: ArrayView2<f64>,
) -> Result<()> {
    let (n, m) = cost.dim();
    if n == 0 || m == 0 {
        return Err(AbcError::EmptySample);
    }
    if w1.len() != n {
        return Err(AbcError::DimensionMismatch {
            expected: n,
            found: w1.len(),
        });
    }
    if w2.len() != m {
        return Err(AbcError::DimensionMismatch {
            expected: m,
            found: w2.len(),
        });
    }
    for (name, w) in [("w1", w1.view()), ("w2", w2.view())] {
        if w.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(AbcError::InfeasibleMarginals(format!(
                "{name} contains negative or non-finite entries"
            )));
        }
        let total = w.sum();
        if (total - 1.0).abs() > MARGINAL_TOLERANCE {
            return Err(AbcError::InfeasibleMarginals(format!(
                "{name} sums to {total}, expected 1"
            )));
        }
    }
    if cost.iter().any(|c| !c.is_finite()) {
        return Err(AbcError::Numerical(
            "cost matrix contains non-finite entries".into(),
        ));
    }
    Ok(())
}

fn is_uniform(w: ArrayView1<f64>) -> bool {
    let target = 1.0 / w.len() as f64;
    w.iter().all(|x| (x - target).abs() <= 1e-12)
}

/**
Solves the square or wide linear assignment problem `min Σ_i cost[i, σ(i)]`.

Returns `σ` as a vector mapping each row to a distinct column. Requires
`nrows <= ncols` and finite costs.

```rust
use ndarray::arr2;
use winference::transport::assignment;

let cost = arr2(&[[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]]);
assert_eq!(assignment(cost.view()).unwrap(), vec![1, 0, 2]);
```
*/
pub fn assignment(cost: ArrayView2<f64>) -> Result<Vec<usize>> {
    let (n, m) = cost.dim();
    if n > m {
        return Err(AbcError::SizeMismatch { left: n, right: m });
    }
    if n == 0 {
        return Ok(Vec::new());
    }
    // 1-based potentials; column 0 is a virtual source.
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; m + 1];
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        owner[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if reduced < minv[j] {
                    minv[j] = reduced;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            if j1 == 0 {
                return Err(AbcError::Numerical(
                    "assignment found no augmenting column".into(),
                ));
            }
            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut sigma = vec![0usize; n];
    for j in 1..=m {
        if owner[j] != 0 {
            sigma[owner[j] - 1] = j - 1;
        }
    }
    Ok(sigma)
}

#[derive(Clone, Copy)]
enum Node {
    Row(usize),
    Col(usize),
}

/// Transportation simplex on a basis of `n + m - 1` cells (a spanning tree of
/// the bipartite row/column graph). Zero-flow basic cells are kept.
fn transportation_simplex(
    w1: ArrayView1<f64>,
    w2: ArrayView1<f64>,
    cost: ArrayView2<f64>,
) -> Result<Array2<f64>> {
    let (n, m) = cost.dim();
    let (mut cells, mut flows) = north_west_corner(w1, w2);

    let scale = cost.iter().fold(1.0_f64, |acc, c| acc.max(c.abs()));
    let optimality_tol = 1e-12 * scale;
    let max_pivots = 50 * (n + m) * (n + m) + 1_000;

    for pivot in 0..max_pivots {
        let mut row_adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut col_adj: Vec<Vec<usize>> = vec![Vec::new(); m];
        for (k, &(i, j)) in cells.iter().enumerate() {
            row_adj[i].push(k);
            col_adj[j].push(k);
        }

        // Dual potentials with u[0] = 0, u_i + v_j = c_ij on basic cells.
        let mut u = vec![f64::NAN; n];
        let mut v = vec![f64::NAN; m];
        u[0] = 0.0;
        let mut stack = vec![Node::Row(0)];
        while let Some(node) = stack.pop() {
            match node {
                Node::Row(i) => {
                    for &k in &row_adj[i] {
                        let j = cells[k].1;
                        if v[j].is_nan() {
                            v[j] = cost[[i, j]] - u[i];
                            stack.push(Node::Col(j));
                        }
                    }
                }
                Node::Col(j) => {
                    for &k in &col_adj[j] {
                        let i = cells[k].0;
                        if u[i].is_nan() {
                            u[i] = cost[[i, j]] - v[j];
                            stack.push(Node::Row(i));
                        }
                    }
                }
            }
        }

        let mut entering = None;
        let mut best = -optimality_tol;
        for i in 0..n {
            for j in 0..m {
                let reduced = cost[[i, j]] - u[i] - v[j];
                if reduced < best {
                    best = reduced;
                    entering = Some((i, j));
                }
            }
        }
        let Some((p, q)) = entering else {
            log::debug!("transportation simplex optimal after {pivot} pivots");
            let mut plan = Array2::<f64>::zeros((n, m));
            for (&(i, j), &x) in cells.iter().zip(flows.iter()) {
                plan[[i, j]] += x.max(0.0);
            }
            return Ok(plan);
        };

        // Tree path from row p to column q; edges listed walking back from q.
        let path = tree_path(&cells, &row_adj, &col_adj, p, q, n, m)?;
        let mut theta = f64::INFINITY;
        let mut leaving = path[0];
        for &k in path.iter().step_by(2) {
            if flows[k] < theta {
                theta = flows[k];
                leaving = k;
            }
        }
        let theta = theta.max(0.0);
        for (pos, &k) in path.iter().enumerate() {
            if pos % 2 == 0 {
                flows[k] -= theta;
            } else {
                flows[k] += theta;
            }
        }
        cells[leaving] = (p, q);
        flows[leaving] = theta;
    }

    Err(AbcError::SolverStalled(max_pivots))
}

fn north_west_corner(w1: ArrayView1<f64>, w2: ArrayView1<f64>) -> (Vec<(usize, usize)>, Vec<f64>) {
    let (n, m) = (w1.len(), w2.len());
    let mut supply = w1.to_vec();
    let mut demand = w2.to_vec();
    let mut cells = Vec::with_capacity(n + m - 1);
    let mut flows = Vec::with_capacity(n + m - 1);
    let (mut i, mut j) = (0usize, 0usize);
    loop {
        let x = supply[i].min(demand[j]).max(0.0);
        cells.push((i, j));
        flows.push(x);
        supply[i] -= x;
        demand[j] -= x;
        if i == n - 1 && j == m - 1 {
            break;
        }
        if i == n - 1 {
            j += 1;
        } else if j == m - 1 || supply[i] <= demand[j] {
            i += 1;
        } else {
            j += 1;
        }
    }
    (cells, flows)
}

/// Returns the basis indices on the unique tree path between `Row(p)` and
/// `Col(q)`, ordered from the `q` end. Even positions lose flow when `(p, q)` enters.
fn tree_path(
    cells: &[(usize, usize)],
    row_adj: &[Vec<usize>],
    col_adj: &[Vec<usize>],
    p: usize,
    q: usize,
    n: usize,
    m: usize,
) -> Result<Vec<usize>> {
    // Node ids: rows 0..n, columns n..n+m.
    let mut parent_edge: Vec<Option<usize>> = vec![None; n + m];
    let mut visited = vec![false; n + m];
    visited[p] = true;
    let mut queue = std::collections::VecDeque::from([Node::Row(p)]);
    while let Some(node) = queue.pop_front() {
        match node {
            Node::Row(i) => {
                for &k in &row_adj[i] {
                    let j = cells[k].1;
                    if !visited[n + j] {
                        visited[n + j] = true;
                        parent_edge[n + j] = Some(k);
                        queue.push_back(Node::Col(j));
                    }
                }
            }
            Node::Col(j) => {
                if j == q {
                    break;
                }
                for &k in &col_adj[j] {
                    let i = cells[k].0;
                    if !visited[i] {
                        visited[i] = true;
                        parent_edge[i] = Some(k);
                        queue.push_back(Node::Row(i));
                    }
                }
            }
        }
    }
    if !visited[n + q] {
        return Err(AbcError::Numerical("transport basis is not connected".into()));
    }

    let mut path = Vec::new();
    let mut node = n + q;
    while node != p {
        let k = parent_edge[node].ok_or_else(|| {
            AbcError::Numerical("broken parent chain in transport basis".into())
        })?;
        path.push(k);
        let (i, j) = cells[k];
        node = if node >= n { i } else { n + j };
    }
    Ok(path)
}
