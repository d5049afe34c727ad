//! A small ABC demo: infers the mean of a bivariate Gaussian from 100 observed
//! points with the swap-based Wasserstein distance, then prints the posterior summary.

use ndarray::{arr1, Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::error::Error;

use winference::distance::{Engine, TransportDistance};
use winference::distributions::{Model, RandomWalkProposal};
use winference::smc::{AbcSmc, SmcConfig};

const NOBS: usize = 100;

/// Unit-variance Gaussian in the plane with unknown mean; flat prior on [-10, 10]².
struct BivariateLocation;

impl Model for BivariateLocation {
    type Data = Array2<f64>;

    fn dim(&self) -> usize {
        2
    }

    fn rprior<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |_| rng.gen_range(-10.0..10.0))
    }

    fn dprior(&self, thetas: ArrayView2<f64>) -> Array1<f64> {
        thetas
            .rows()
            .into_iter()
            .map(|t| {
                if t.iter().all(|x| x.abs() <= 10.0) {
                    0.0
                } else {
                    f64::NEG_INFINITY
                }
            })
            .collect()
    }

    fn simulate<R: Rng + ?Sized>(&self, theta: ArrayView1<f64>, rng: &mut R) -> Array2<f64> {
        Array2::from_shape_fn((NOBS, 2), |(_, k)| {
            theta[k] + rng.sample::<f64, _>(StandardNormal)
        })
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    const SEED: u64 = 42;

    let truth = arr1(&[2.0, -1.0]);
    let observed = BivariateLocation.simulate(truth.view(), &mut SmallRng::seed_from_u64(SEED));
    let distance = TransportDistance::new(observed, 1.0, 2.0, Engine::swap(1e-10))?;

    let config = SmcConfig {
        nthetas: 256,
        maxstep: Some(15),
        maxsimulation: Some(200_000),
        seed: SEED,
        ..SmcConfig::default()
    };
    let mut smc = AbcSmc::new(BivariateLocation, distance, RandomWalkProposal::new(1.0), config)?;
    let history = smc.run_progress()?;

    println!("Status: {:?}", history.status());
    println!(
        "Steps: {}, simulations: {}",
        history.len() - 1,
        history.total_simulations()
    );
    if let Some(last) = history.last() {
        println!("Final threshold: {:.4}", last.threshold);
        println!(
            "Final acceptance rate: {:.3}, stuck fraction: {:.3}",
            last.acceptance_rate, last.stuck_fraction
        );
    }
    if let Some(mean) = history.posterior_mean() {
        println!(
            "Posterior mean: ({:.3}, {:.3}), truth: ({:.1}, {:.1})",
            mean[0], mean[1], truth[0], truth[1]
        );
    }
    Ok(())
}
