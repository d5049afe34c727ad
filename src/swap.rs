//! Swap-based local search for the optimal assignment between two equal-size samples.
//!
//! Starts from the Hilbert rank matching and repeatedly applies the single best
//! pairwise swap of partners, as long as it lowers the total matched cost by more
//! than `tolerance`. The result is a local optimum of the 2-exchange
//! neighbourhood: never worse than the Hilbert surrogate and never better than
//! the exact transport distance.

use ndarray::ArrayView2;

use crate::cost::{check_samples, CostMatrixBuilder, GroundNorm};
use crate::error::{AbcError, NumericalWarning, Result};
use crate::hilbert::hilbert_matching;

pub const DEFAULT_MAX_PASSES: usize = 10_000;

/// Swap heuristic configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapSolver {
    /// Transport exponent.
    pub p: f64,
    /// Pointwise ground cost.
    pub ground: CostMatrixBuilder,
    /// Minimum cost reduction for a swap to count as an improvement. Non-negative.
    pub tolerance: f64,
    /// Cap on the number of scans over all index pairs.
    pub max_passes: usize,
}

/// Outcome of [`SwapSolver::solve`].
#[derive(Debug, Clone, PartialEq)]
pub struct SwapResult {
    pub distance: f64,
    /// `a[i]` is matched with `b[matching[i]]`.
    pub matching: Vec<usize>,
    /// Number of scans performed, including the final one that found no improvement.
    pub passes: usize,
    /// `false` when `max_passes` ran out before a local optimum was reached.
    pub converged: bool,
}

impl SwapSolver {
    pub fn new(p: f64, ground_p: f64, tolerance: f64) -> Self {
        Self {
            p,
            ground: CostMatrixBuilder::new(ground_p),
            tolerance,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }

    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn with_norm(mut self, norm: GroundNorm) -> Self {
        self.ground.norm = norm;
        self
    }

    pub fn solve(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<SwapResult> {
        check_samples(a, b)?;
        if a.nrows() != b.nrows() {
            return Err(AbcError::SizeMismatch {
                left: a.nrows(),
                right: b.nrows(),
            });
        }
        if !(self.p >= 1.0) {
            return Err(AbcError::config(format!("p must be >= 1, got {}", self.p)));
        }
        if !(self.tolerance >= 0.0) {
            return Err(AbcError::config(format!(
                "swap tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }
        if self.max_passes == 0 {
            return Err(AbcError::config("swap solver needs at least one pass"));
        }
        let cost = self.ground.build(a, b)?;
        let n = a.nrows();
        let mut matching = hilbert_matching(a, b)?;

        let mut passes = 0;
        let mut converged = false;
        for pass in 1..=self.max_passes {
            passes = pass;
            let mut best_gain = self.tolerance;
            let mut best = None;
            for i in 0..n {
                for k in (i + 1)..n {
                    let (ji, jk) = (matching[i], matching[k]);
                    let gain = cost[[i, ji]] + cost[[k, jk]] - cost[[i, jk]] - cost[[k, ji]];
                    if gain > best_gain {
                        best_gain = gain;
                        best = Some((i, k));
                    }
                }
            }
            match best {
                Some((i, k)) => matching.swap(i, k),
                None => {
                    converged = true;
                    break;
                }
            }
        }
        if !converged {
            log::warn!("{}", NumericalWarning::SwapNotConverged { passes });
        }

        let total: f64 = matching
            .iter()
            .enumerate()
            .map(|(i, &j)| cost[[i, j]])
            .sum();
        Ok(SwapResult {
            distance: (total / n as f64).powf(1.0 / self.p),
            matching,
            passes,
            converged,
        })
    }
}
