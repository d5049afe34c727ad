/*!
# Entropic optimal transport (Sinkhorn)

Entropy-regularised transport between two weighted samples, computed by
alternating scaling of the dual vectors. The iteration runs in the log domain so
that very small regularisers do not underflow the Gibbs kernel `exp(-C/eps)`,
and always performs exactly `niterations` rounds: per-call cost stays bounded and
results do not depend on a convergence test.

Two values are reported by [`SinkhornSolver::divergence`]:
- `raw = (Σ plan·cost)^(1/p)` for the regularised plan between A and B;
- `corrected = raw(A,B) - raw(A,A)/2 - raw(B,B)/2`, which vanishes on identical
  samples and approaches the exact transport distance as `eps` shrinks.

```rust
use ndarray::arr2;
use winference::cost::CostMatrixBuilder;
use winference::sinkhorn::SinkhornSolver;
use winference::transport::uniform_weights;

let a = arr2(&[[0.0], [10.0]]);
let b = arr2(&[[1.0], [9.0]]);
let w = uniform_weights(2);
let solver = SinkhornSolver::new(1.0, 0.01, 1000).unwrap();
let d = solver
    .divergence(a.view(), b.view(), w.view(), w.view(), &CostMatrixBuilder::new(1.0))
    .unwrap();
assert!((d.corrected - 1.0).abs() < 0.05);
```
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::cost::CostMatrixBuilder;
use crate::error::{AbcError, NumericalWarning, Result};
use crate::transport::check_marginals;

/// Relative plan-mass loss above which a [`NumericalWarning::SinkhornMassUnderflow`] is raised.
const MASS_TOLERANCE: f64 = 1e-6;

/// Entropic transport solver with a fixed regulariser and iteration count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkhornSolver {
    /// Transport exponent.
    pub p: f64,
    /// Entropic regulariser, strictly positive.
    pub eps: f64,
    /// Number of scaling rounds.
    pub niterations: usize,
}

/// Regularised plan between two marginals.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkhornPlan {
    pub plan: Array2<f64>,
    /// `(Σ plan·cost)^(1/p)`.
    pub raw: f64,
    /// Total mass carried by `plan`; one up to rounding when nothing underflowed.
    pub mass: f64,
    pub warnings: Vec<NumericalWarning>,
}

/// Raw and debiased Sinkhorn distances between two samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkhornDistance {
    pub raw: f64,
    pub corrected: f64,
    pub warnings: Vec<NumericalWarning>,
}

impl SinkhornSolver {
    /// Creates a solver, rejecting `eps <= 0`, `niterations == 0` and `p < 1`.
    pub fn new(p: f64, eps: f64, niterations: usize) -> Result<Self> {
        let solver = Self {
            p,
            eps,
            niterations,
        };
        solver.validate()?;
        Ok(solver)
    }

    fn validate(&self) -> Result<()> {
        let Self {
            p,
            eps,
            niterations,
        } = *self;
        if !(eps > 0.0) || !eps.is_finite() {
            return Err(AbcError::config(format!(
                "sinkhorn regulariser must be positive, got {eps}"
            )));
        }
        if niterations == 0 {
            return Err(AbcError::config("sinkhorn needs at least one iteration"));
        }
        if !(p >= 1.0) {
            return Err(AbcError::config(format!("p must be >= 1, got {p}")));
        }
        Ok(())
    }

    /// Runs the scaling iterations between `w1` (rows) and `w2` (columns).
    pub fn solve(
        &self,
        w1: ArrayView1<f64>,
        w2: ArrayView1<f64>,
        cost: ArrayView2<f64>,
    ) -> Result<SinkhornPlan> {
        self.validate()?;
        check_marginals(w1, w2, cost)?;
        let (n, m) = cost.dim();
        let log_w1 = w1.mapv(f64::ln);
        let log_w2 = w2.mapv(f64::ln);
        let log_k = cost.mapv(|c| -c / self.eps);

        // u = v = 1 initially.
        let mut log_u = Array1::<f64>::zeros(n);
        let mut log_v = Array1::<f64>::zeros(m);
        let mut scratch = Vec::with_capacity(n.max(m));

        for _ in 0..self.niterations {
            for (i, row) in log_k.outer_iter().enumerate() {
                scratch.clear();
                scratch.extend(row.iter().zip(log_v.iter()).map(|(k, v)| k + v));
                log_u[i] = log_w1[i] - log_sum_exp(&scratch);
            }
            for (j, col) in log_k.axis_iter(Axis(1)).enumerate() {
                scratch.clear();
                scratch.extend(col.iter().zip(log_u.iter()).map(|(k, u)| k + u));
                log_v[j] = log_w2[j] - log_sum_exp(&scratch);
            }
        }

        let mut plan = Array2::<f64>::zeros((n, m));
        for ((i, j), x) in plan.indexed_iter_mut() {
            let log_p = log_u[i] + log_k[[i, j]] + log_v[j];
            *x = if log_p.is_nan() { 0.0 } else { log_p.exp() };
        }

        let mut warnings = Vec::new();
        let mass = plan.sum();
        if let Some(w) = mass_warning(&plan, w1, self.eps) {
            log::warn!("{w}");
            warnings.push(w);
        }

        let total = (&plan * &cost).sum().max(0.0);
        Ok(SinkhornPlan {
            raw: total.powf(1.0 / self.p),
            plan,
            mass,
            warnings,
        })
    }

    /// Raw and debiased distances between samples `a` (weights `w1`) and `b` (weights `w2`).
    ///
    /// The self terms reuse this solver's `eps` and `niterations` with marginals
    /// `(w1, w1)` and `(w2, w2)`.
    pub fn divergence(
        &self,
        a: ArrayView2<f64>,
        b: ArrayView2<f64>,
        w1: ArrayView1<f64>,
        w2: ArrayView1<f64>,
        builder: &CostMatrixBuilder,
    ) -> Result<SinkhornDistance> {
        let ab = self.solve(w1, w2, builder.build(a, b)?.view())?;
        let aa = self.solve(w1, w1, builder.build(a, a)?.view())?;
        let bb = self.solve(w2, w2, builder.build(b, b)?.view())?;

        let corrected = ab.raw - 0.5 * aa.raw - 0.5 * bb.raw;
        let mut warnings: Vec<NumericalWarning> = ab
            .warnings
            .into_iter()
            .chain(aa.warnings)
            .chain(bb.warnings)
            .collect();
        if corrected < 0.0 {
            let w = NumericalWarning::NegativeCorrectedDistance { value: corrected };
            log::warn!("{w}");
            warnings.push(w);
        }
        Ok(SinkhornDistance {
            raw: ab.raw,
            corrected,
            warnings,
        })
    }
}

fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

/// Flags plans whose total mass drifted from one or whose positive-weight rows vanished.
fn mass_warning(plan: &Array2<f64>, w1: ArrayView1<f64>, eps: f64) -> Option<NumericalWarning> {
    let mass = plan.sum();
    let empty_row = plan
        .sum_axis(Axis(1))
        .iter()
        .zip(w1.iter())
        .any(|(row, w)| *w > 0.0 && *row == 0.0);
    if empty_row || !mass.is_finite() || (mass - 1.0).abs() > MASS_TOLERANCE {
        Some(NumericalWarning::SinkhornMassUnderflow { eps, mass })
    } else {
        None
    }
}
