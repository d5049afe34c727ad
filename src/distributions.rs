/*!
Model and proposal capabilities used by the sampler.

A [`Model`] is a prior plus a simulator; the sampler never evaluates a
likelihood. A [`Proposal`] is re-fitted to the resampled population at every
SMC step and then drives the r-hit MCMC moves.

# Examples

```rust
use ndarray::{arr1, arr2};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use winference::distributions::{IndependentGaussianProposal, Proposal, RandomWalkProposal};

let thetas = arr2(&[[0.0, 1.0], [1.0, 0.5], [2.0, 2.0], [0.5, 0.0]]);
let mut rng = SmallRng::seed_from_u64(7);

let rw = RandomWalkProposal::new(1.0).fit(thetas.view()).unwrap();
let moved = rw.sample(arr1(&[0.0, 0.0]).view(), &mut rng);
assert_eq!(moved.len(), 2);
// Symmetric, so the Hastings correction vanishes.
assert_eq!(rw.log_density_ratio(arr1(&[0.0, 0.0]).view(), moved.view()), 0.0);

let ind = IndependentGaussianProposal::new(1.0).fit(thetas.view()).unwrap();
let draw = ind.sample(arr1(&[0.0, 0.0]).view(), &mut rng);
assert!(ind.log_density_ratio(arr1(&[0.0, 0.0]).view(), draw.view()).is_finite());
```
*/

use ndarray::prelude::*;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::error::{AbcError, Result};
use crate::stats;

/// A generative model: a prior over parameters and a simulator.
pub trait Model: Sync {
    /// Simulated dataset; compared to the observed one through a discrepancy.
    type Data: Clone + Send + Sync;

    /// Parameter dimension.
    fn dim(&self) -> usize;

    /// Draws `n` parameters from the prior, one per row.
    fn rprior<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f64>;

    /// Prior log-density of each row of `thetas`; `-inf` outside the support.
    fn dprior(&self, thetas: ArrayView2<f64>) -> Array1<f64>;

    /// Simulates one dataset at `theta`.
    fn simulate<R: Rng + ?Sized>(&self, theta: ArrayView1<f64>, rng: &mut R) -> Self::Data;
}

/// Prior log-density of a single parameter vector.
pub(crate) fn log_prior<M: Model>(model: &M, theta: ArrayView1<f64>) -> f64 {
    model
        .dprior(theta.insert_axis(Axis(0)))
        .get(0)
        .copied()
        .unwrap_or(f64::NEG_INFINITY)
}

/// An MCMC proposal fitted to a particle population.
pub trait Proposal: Sized + Send + Sync {
    /// Returns a copy of this proposal adapted to `thetas` (one particle per row).
    fn fit(&self, thetas: ArrayView2<f64>) -> Result<Self>;

    /// Draws θ' ~ q(· | θ).
    fn sample<R: Rng + ?Sized>(&self, theta: ArrayView1<f64>, rng: &mut R) -> Array1<f64>;

    /// `log q(θ | θ') − log q(θ' | θ)`, the Hastings correction.
    fn log_density_ratio(&self, theta: ArrayView1<f64>, proposed: ArrayView1<f64>) -> f64;
}

fn standard_normal<R: Rng + ?Sized>(d: usize, rng: &mut R) -> Array1<f64> {
    Array1::from_shape_fn(d, |_| rng.sample(StandardNormal))
}

fn fitted_cholesky(thetas: ArrayView2<f64>, scale: f64) -> Result<Array2<f64>> {
    if thetas.nrows() == 0 {
        return Err(AbcError::EmptySample);
    }
    let cov = stats::covariance(thetas)? * (scale * scale);
    stats::cholesky(cov.view())
}

/**
Gaussian random walk `θ' = θ + L z`, `z ~ N(0, I)`, with `L Lᵀ = scale² Σ̂` for
the empirical covariance `Σ̂` of the population it was fitted on.

Before any fit the step is `scale · z`.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct RandomWalkProposal {
    pub scale: f64,
    chol: Option<Array2<f64>>,
}

impl RandomWalkProposal {
    pub fn new(scale: f64) -> Self {
        Self { scale, chol: None }
    }

    /// Cholesky factor of the step covariance, once fitted.
    pub fn cholesky(&self) -> Option<ArrayView2<'_, f64>> {
        self.chol.as_ref().map(|l| l.view())
    }
}

impl Proposal for RandomWalkProposal {
    fn fit(&self, thetas: ArrayView2<f64>) -> Result<Self> {
        if !(self.scale > 0.0) {
            return Err(AbcError::config(format!(
                "random walk scale must be positive, got {}",
                self.scale
            )));
        }
        Ok(Self {
            scale: self.scale,
            chol: Some(fitted_cholesky(thetas, self.scale)?),
        })
    }

    fn sample<R: Rng + ?Sized>(&self, theta: ArrayView1<f64>, rng: &mut R) -> Array1<f64> {
        let z = standard_normal(theta.len(), rng);
        match &self.chol {
            Some(l) if l.nrows() == theta.len() => &theta + &l.dot(&z),
            _ => &theta + &(z * self.scale),
        }
    }

    fn log_density_ratio(&self, _theta: ArrayView1<f64>, _proposed: ArrayView1<f64>) -> f64 {
        0.0
    }
}

/// Independent Gaussian `N(μ̂, inflation² Σ̂)` fitted to the population,
/// a single-component version of a mixture proposal.
///
/// Unfitted, it proposes the current state back, which is always a no-op move.
#[derive(Debug, Clone, PartialEq)]
pub struct IndependentGaussianProposal {
    pub inflation: f64,
    mean: Array1<f64>,
    chol: Array2<f64>,
}

impl IndependentGaussianProposal {
    pub fn new(inflation: f64) -> Self {
        Self {
            inflation,
            mean: Array1::zeros(0),
            chol: Array2::zeros((0, 0)),
        }
    }

    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }

    fn is_fitted(&self, d: usize) -> bool {
        self.mean.len() == d && d > 0
    }

    /// log N(x; μ̂, L Lᵀ).
    pub fn log_density(&self, x: ArrayView1<f64>) -> f64 {
        let d = x.len();
        let centred = &x - &self.mean;
        let z = stats::forward_substitute(self.chol.view(), centred.view());
        let log_det: f64 = self.chol.diag().mapv(f64::ln).sum();
        -0.5 * z.dot(&z) - log_det - 0.5 * d as f64 * (2.0 * PI).ln()
    }
}

impl Proposal for IndependentGaussianProposal {
    fn fit(&self, thetas: ArrayView2<f64>) -> Result<Self> {
        if !(self.inflation > 0.0) {
            return Err(AbcError::config(format!(
                "proposal inflation must be positive, got {}",
                self.inflation
            )));
        }
        Ok(Self {
            inflation: self.inflation,
            mean: stats::mean(thetas)?,
            chol: fitted_cholesky(thetas, self.inflation)?,
        })
    }

    fn sample<R: Rng + ?Sized>(&self, theta: ArrayView1<f64>, rng: &mut R) -> Array1<f64> {
        if !self.is_fitted(theta.len()) {
            return theta.to_owned();
        }
        let z = standard_normal(theta.len(), rng);
        &self.mean + &self.chol.dot(&z)
    }

    fn log_density_ratio(&self, theta: ArrayView1<f64>, proposed: ArrayView1<f64>) -> f64 {
        if !self.is_fitted(theta.len()) {
            return 0.0;
        }
        self.log_density(theta) - self.log_density(proposed)
    }
}
