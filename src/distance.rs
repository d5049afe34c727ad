/*!
# Discrepancies between simulated and observed data

The sampler only needs one thing from a distance: a non-negative number for a
simulated dataset. [`Discrepancy`] is that capability. It is implemented by

- [`TransportDistance`], which holds the observed sample and compares it with
  a simulated one (same dimension, possibly a different number of points)
  using one of the four [`Engine`]s;
- [`CurveMatching`], which treats rows as consecutive time steps and appends a
  scaled time coordinate before comparing, so points are matched close in
  both value and time;
- any `Fn(&D) -> Result<f64> + Sync` closure, for summary-statistic distances
  or anything else.

```rust
use ndarray::arr2;
use winference::distance::{Discrepancy, Engine, TransportDistance};

let observed = arr2(&[[0.0], [10.0]]);
let distance = TransportDistance::new(observed, 1.0, 1.0, Engine::Exact).unwrap();
let d = distance.distance(&arr2(&[[9.0], [1.0]])).unwrap();
assert!((d - 1.0).abs() < 1e-12);
```
*/

use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};

use crate::cost::{CostMatrixBuilder, GroundNorm};
use crate::error::{AbcError, Result};
use crate::hilbert::HilbertSort;
use crate::sinkhorn::SinkhornSolver;
use crate::swap::{SwapSolver, DEFAULT_MAX_PASSES};
use crate::transport::{uniform_weights, ExactTransport};

/// Distance from a simulated dataset to the observed one.
pub trait Discrepancy<D>: Sync {
    fn distance(&self, data: &D) -> Result<f64>;
}

impl<D, F> Discrepancy<D> for F
where
    F: Fn(&D) -> Result<f64> + Sync,
{
    fn distance(&self, data: &D) -> Result<f64> {
        self(data)
    }
}

/// Which solver a [`TransportDistance`] uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Engine {
    /// Exact optimal transport with uniform weights.
    Exact,
    /// Debiased Sinkhorn divergence, clamped at zero.
    Sinkhorn { eps: f64, niterations: usize },
    /// Hilbert rank matching. Needs equal sample sizes.
    Hilbert,
    /// Swap local search started from the Hilbert matching. Needs equal sample sizes.
    Swap { tolerance: f64, max_passes: usize },
}

impl Engine {
    pub fn swap(tolerance: f64) -> Self {
        Engine::Swap {
            tolerance,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }
}

/// Transport distance to a fixed observed sample.
#[derive(Debug, Clone)]
pub struct TransportDistance {
    observed: Array2<f64>,
    observed_weights: Array1<f64>,
    p: f64,
    ground: CostMatrixBuilder,
    engine: Engine,
}

impl TransportDistance {
    /// Validates the engine parameters up front so that a bad configuration
    /// fails before the sampler spends any simulations.
    pub fn new(observed: Array2<f64>, p: f64, ground_p: f64, engine: Engine) -> Result<Self> {
        if observed.nrows() == 0 {
            return Err(AbcError::EmptySample);
        }
        if !(p >= 1.0) || !(ground_p >= 1.0) {
            return Err(AbcError::config(format!(
                "p and ground_p must be >= 1, got {p} and {ground_p}"
            )));
        }
        match engine {
            Engine::Sinkhorn { eps, niterations } => {
                SinkhornSolver::new(p, eps, niterations)?;
            }
            Engine::Swap {
                tolerance,
                max_passes,
            } => {
                if max_passes == 0 {
                    return Err(AbcError::config("swap solver needs at least one pass"));
                }
                if !(tolerance >= 0.0) {
                    return Err(AbcError::config(format!(
                        "swap tolerance must be non-negative, got {tolerance}"
                    )));
                }
            }
            _ => {}
        }
        Ok(Self {
            observed_weights: uniform_weights(observed.nrows()),
            observed,
            p,
            ground: CostMatrixBuilder::new(ground_p),
            engine,
        })
    }

    pub fn with_norm(mut self, norm: GroundNorm) -> Self {
        self.ground.norm = norm;
        self
    }

    pub fn observed(&self) -> ArrayView2<'_, f64> {
        self.observed.view()
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Distance between `simulated` and the observed sample.
    pub fn to_observed(&self, simulated: ArrayView2<f64>) -> Result<f64> {
        let observed = self.observed.view();
        match self.engine {
            Engine::Exact => {
                let cost = self.ground.build(simulated, observed)?;
                let w = uniform_weights(simulated.nrows());
                let solution = ExactTransport::new(self.p).solve(
                    w.view(),
                    self.observed_weights.view(),
                    cost.view(),
                )?;
                Ok(solution.distance)
            }
            Engine::Sinkhorn { eps, niterations } => {
                let solver = SinkhornSolver::new(self.p, eps, niterations)?;
                let w = uniform_weights(simulated.nrows());
                let divergence = solver.divergence(
                    simulated,
                    observed,
                    w.view(),
                    self.observed_weights.view(),
                    &self.ground,
                )?;
                Ok(divergence.corrected.max(0.0))
            }
            Engine::Hilbert => HilbertSort {
                p: self.p,
                ground: self.ground,
            }
            .distance(simulated, observed),
            Engine::Swap {
                tolerance,
                max_passes,
            } => {
                let solver = SwapSolver {
                    p: self.p,
                    ground: self.ground,
                    tolerance,
                    max_passes,
                };
                Ok(solver.solve(simulated, observed)?.distance)
            }
        }
    }
}

impl Discrepancy<Array2<f64>> for TransportDistance {
    fn distance(&self, data: &Array2<f64>) -> Result<f64> {
        self.to_observed(data.view())
    }
}

/// Prepends `lambda · t` to each row, `t` being the row index.
pub fn augment_with_time(series: ArrayView2<f64>, lambda: f64) -> Array2<f64> {
    let n = series.nrows();
    let time = Array2::from_shape_fn((n, 1), |(t, _)| lambda * t as f64);
    // Shapes agree by construction.
    concatenate(Axis(1), &[time.view(), series.view()]).unwrap_or_else(|_| series.to_owned())
}

/// Curve-matching distance for time series: rows are successive times.
///
/// Larger `lambda` forces matched points to be closer in time; `lambda = 0`
/// ignores time and reduces to the base engine on the raw values.
#[derive(Debug, Clone)]
pub struct CurveMatching {
    base: TransportDistance,
    lambda: f64,
}

impl CurveMatching {
    pub fn new(
        observed: ArrayView2<f64>,
        lambda: f64,
        p: f64,
        ground_p: f64,
        engine: Engine,
    ) -> Result<Self> {
        if !(lambda >= 0.0) || !lambda.is_finite() {
            return Err(AbcError::config(format!(
                "time weight must be finite and >= 0, got {lambda}"
            )));
        }
        let base = TransportDistance::new(augment_with_time(observed, lambda), p, ground_p, engine)?;
        Ok(Self { base, lambda })
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }
}

impl Discrepancy<Array2<f64>> for CurveMatching {
    fn distance(&self, data: &Array2<f64>) -> Result<f64> {
        self.base
            .to_observed(augment_with_time(data.view(), self.lambda).view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn scenario(engine: Engine) -> f64 {
        let observed = arr2(&[[0.0], [10.0]]);
        TransportDistance::new(observed, 1.0, 1.0, engine)
            .unwrap()
            .distance(&arr2(&[[1.0], [9.0]]))
            .unwrap()
    }

    #[test]
    fn every_engine_agrees_on_two_point_scenario() {
        assert_abs_diff_eq!(scenario(Engine::Exact), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scenario(Engine::Hilbert), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scenario(Engine::swap(1e-12)), 1.0, epsilon = 1e-12);
        let sinkhorn = scenario(Engine::Sinkhorn {
            eps: 0.05,
            niterations: 500,
        });
        assert!((sinkhorn - 1.0).abs() < 0.05, "sinkhorn gave {sinkhorn}");
    }

    #[test]
    fn sinkhorn_is_never_negative() {
        let observed = arr2(&[[0.0, 0.0], [1.0, 1.0], [0.5, 0.2]]);
        let d = TransportDistance::new(
            observed.clone(),
            2.0,
            2.0,
            Engine::Sinkhorn {
                eps: 1.0,
                niterations: 50,
            },
        )
        .unwrap()
        .distance(&observed)
        .unwrap();
        assert!(d >= 0.0);
    }

    #[test]
    fn exact_engine_accepts_unequal_sizes() {
        let observed = arr2(&[[0.0], [1.0], [2.0]]);
        let d = TransportDistance::new(observed, 1.0, 1.0, Engine::Exact)
            .unwrap()
            .distance(&arr2(&[[1.0]]))
            .unwrap();
        assert_abs_diff_eq!(d, 2.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn bad_engine_parameters_fail_on_construction() {
        let observed = arr2(&[[0.0]]);
        let bad = Engine::Sinkhorn {
            eps: 0.0,
            niterations: 10,
        };
        assert!(matches!(
            TransportDistance::new(observed.clone(), 1.0, 1.0, bad),
            Err(AbcError::InvalidConfig(_))
        ));
        assert!(matches!(
            TransportDistance::new(observed.clone(), 1.0, 1.0, Engine::swap(-1.0)),
            Err(AbcError::InvalidConfig(_))
        ));
        assert!(matches!(
            TransportDistance::new(observed, 0.5, 1.0, Engine::Exact),
            Err(AbcError::InvalidConfig(_))
        ));
        assert_eq!(
            TransportDistance::new(Array2::zeros((0, 1)), 1.0, 1.0, Engine::Exact).err(),
            Some(AbcError::EmptySample)
        );
    }

    #[test]
    fn closures_are_discrepancies() {
        let mean_gap = |y: &Vec<f64>| -> Result<f64> {
            Ok((y.iter().sum::<f64>() / y.len() as f64 - 2.0).abs())
        };
        assert_abs_diff_eq!(mean_gap.distance(&vec![1.0, 2.0, 6.0]).unwrap(), 1.0);
    }

    #[test]
    fn time_augmentation() {
        let series = arr2(&[[5.0], [6.0], [7.0]]);
        let augmented = augment_with_time(series.view(), 2.0);
        assert_eq!(augmented, arr2(&[[0.0, 5.0], [2.0, 6.0], [4.0, 7.0]]));
    }

    #[test]
    fn curve_matching_penalises_time_shifts() {
        // Same values, reversed in time: zero without time weight, positive with it.
        let observed = arr2(&[[0.0], [1.0], [2.0], [3.0]]);
        let reversed = arr2(&[[3.0], [2.0], [1.0], [0.0]]);
        let flat = CurveMatching::new(observed.view(), 0.0, 1.0, 1.0, Engine::Exact).unwrap();
        let timed = CurveMatching::new(observed.view(), 1.0, 1.0, 1.0, Engine::Exact).unwrap();
        assert_abs_diff_eq!(flat.distance(&reversed).unwrap(), 0.0, epsilon = 1e-12);
        assert!(timed.distance(&reversed).unwrap() > 0.5);
        assert_abs_diff_eq!(timed.distance(&observed).unwrap(), 0.0, epsilon = 1e-12);
    }
}
