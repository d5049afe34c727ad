/*!
# r-hit ABC-MCMC kernel

One application moves a particle with Metropolis–Hastings steps whose
acceptance additionally requires the simulated dataset to fall within the
current threshold. A *hit* is such an accepted move, and the kernel keeps
proposing until it has `r` hits or has spent `maxtrials` proposals.

Each trial:

1. draws θ' from the proposal;
2. rejects immediately, without simulating, if θ' lies outside the prior's support;
3. otherwise simulates y' at θ' and computes its distance d';
4. counts a hit when d' ≤ τ and
   `log U < log π(θ') − log π(θ) + log q(θ | θ') − log q(θ' | θ)`,
   in which case the particle moves to (θ', y', d').

If the trials run out first the last accepted state is returned with
`stuck = true`.
*/

use ndarray::Array1;
use rand::Rng;

use crate::distance::Discrepancy;
use crate::distributions::{log_prior, Model, Proposal};
use crate::error::{AbcError, Result};
use crate::smc::Particle;

/// Kernel parameters. `r` hits are needed within `maxtrials` proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RHitKernel {
    pub r: usize,
    pub maxtrials: usize,
}

/// Result of one kernel application.
#[derive(Debug, Clone)]
pub struct MoveOutcome<D> {
    pub particle: Particle<D>,
    /// Simulator calls made; trials outside the prior support cost none.
    pub nsimulations: usize,
    pub hits: usize,
    pub trials: usize,
    /// `true` when fewer than `r` hits were collected.
    pub stuck: bool,
}

impl RHitKernel {
    pub fn new(r: usize, maxtrials: usize) -> Result<Self> {
        if r == 0 {
            return Err(AbcError::config("r-hit kernel needs r >= 1"));
        }
        if maxtrials < r {
            return Err(AbcError::config(format!(
                "maxtrials ({maxtrials}) must be at least r ({r})"
            )));
        }
        Ok(Self { r, maxtrials })
    }

    pub fn apply<M, Dist, Q, R>(
        &self,
        model: &M,
        discrepancy: &Dist,
        proposal: &Q,
        particle: Particle<M::Data>,
        threshold: f64,
        rng: &mut R,
    ) -> Result<MoveOutcome<M::Data>>
    where
        M: Model,
        Dist: Discrepancy<M::Data> + ?Sized,
        Q: Proposal,
        R: Rng + ?Sized,
    {
        let mut current = particle;
        let mut current_log_prior = log_prior(model, current.theta.view());
        let mut hits = 0;
        let mut trials = 0;
        let mut nsimulations = 0;

        while hits < self.r && trials < self.maxtrials {
            trials += 1;
            let proposed: Array1<f64> = proposal.sample(current.theta.view(), rng);
            let proposed_log_prior = log_prior(model, proposed.view());
            if proposed_log_prior == f64::NEG_INFINITY || proposed_log_prior.is_nan() {
                continue;
            }

            let data = model.simulate(proposed.view(), rng);
            nsimulations += 1;
            let distance = checked(discrepancy.distance(&data)?)?;

            let log_ratio = proposed_log_prior - current_log_prior
                + proposal.log_density_ratio(current.theta.view(), proposed.view());
            let u: f64 = rng.gen();
            if distance <= threshold && u.ln() < log_ratio {
                hits += 1;
                current = Particle {
                    theta: proposed,
                    data,
                    distance,
                    weight: current.weight,
                };
                current_log_prior = proposed_log_prior;
            }
        }

        Ok(MoveOutcome {
            particle: current,
            nsimulations,
            hits,
            trials,
            stuck: hits < self.r,
        })
    }
}

/// Rejects NaN and negative distances, which would corrupt the threshold schedule.
pub(crate) fn checked(distance: f64) -> Result<f64> {
    if distance.is_nan() || distance < 0.0 {
        return Err(AbcError::Numerical(format!(
            "discrepancy returned {distance}, expected a non-negative number"
        )));
    }
    Ok(distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{IndependentGaussianProposal, RandomWalkProposal};
    use ndarray::{arr1, arr2, Array2, ArrayView1, ArrayView2};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    /// Uniform prior on [0, 1]; the "dataset" is θ itself.
    struct Identity;

    impl Model for Identity {
        type Data = f64;

        fn dim(&self) -> usize {
            1
        }

        fn rprior<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f64> {
            Array2::from_shape_fn((n, 1), |_| rng.gen())
        }

        fn dprior(&self, thetas: ArrayView2<f64>) -> Array1<f64> {
            thetas
                .rows()
                .into_iter()
                .map(|row| {
                    if (0.0..=1.0).contains(&row[0]) {
                        0.0
                    } else {
                        f64::NEG_INFINITY
                    }
                })
                .collect()
        }

        fn simulate<R: Rng + ?Sized>(&self, theta: ArrayView1<f64>, _rng: &mut R) -> f64 {
            theta[0]
        }
    }

    fn gap(y: &f64) -> Result<f64> {
        Ok((y - 0.5).abs())
    }

    fn start() -> Particle<f64> {
        Particle {
            theta: arr1(&[0.5]),
            data: 0.5,
            distance: 0.0,
            weight: 1.0,
        }
    }

    #[test]
    fn reaches_r_hits_with_generous_trial_cap() {
        let kernel = RHitKernel::new(3, 10_000).unwrap();
        let proposal = RandomWalkProposal::new(0.2);
        let mut rng = SmallRng::seed_from_u64(8);
        for _ in 0..20 {
            let out = kernel
                .apply(&Identity, &gap, &proposal, start(), 0.3, &mut rng)
                .unwrap();
            assert!(!out.stuck);
            assert_eq!(out.hits, 3);
            assert!(out.particle.distance <= 0.3);
            assert!(out.nsimulations <= out.trials);
        }
    }

    #[test]
    fn infeasible_threshold_leaves_particle_stuck() {
        let kernel = RHitKernel::new(2, 50).unwrap();
        let proposal = RandomWalkProposal::new(0.2);
        let mut rng = SmallRng::seed_from_u64(9);
        let out = kernel
            .apply(&Identity, &gap, &proposal, start(), -1.0, &mut rng)
            .unwrap();
        assert!(out.stuck);
        assert_eq!(out.hits, 0);
        assert_eq!(out.trials, 50);
        assert_eq!(out.particle.theta, arr1(&[0.5]));
    }

    #[test]
    fn proposals_outside_support_simulate_nothing() {
        // Every proposal lands far outside [0, 1].
        struct FarAway;
        impl Proposal for FarAway {
            fn fit(&self, _: ArrayView2<f64>) -> Result<Self> {
                Ok(FarAway)
            }
            fn sample<R: Rng + ?Sized>(&self, _: ArrayView1<f64>, _: &mut R) -> Array1<f64> {
                arr1(&[10.0])
            }
            fn log_density_ratio(&self, _: ArrayView1<f64>, _: ArrayView1<f64>) -> f64 {
                0.0
            }
        }
        let kernel = RHitKernel::new(1, 25).unwrap();
        let mut rng = SmallRng::seed_from_u64(10);
        let out = kernel
            .apply(&Identity, &gap, &FarAway, start(), 1.0, &mut rng)
            .unwrap();
        assert_eq!(out.nsimulations, 0);
        assert_eq!(out.trials, 25);
        assert!(out.stuck);
    }

    #[test]
    fn independent_proposal_chain_recovers_the_prior() {
        // τ = ∞ makes every simulation admissible, so single-trial applications
        // form a Metropolis–Hastings chain targeting the U(0, 1) prior. The
        // proposal N(0.7, 0.18) is off-centre and needs the Hastings correction.
        let proposal = IndependentGaussianProposal::new(1.0)
            .fit(arr2(&[[0.4], [1.0]]).view())
            .unwrap();
        let kernel = RHitKernel::new(1, 1).unwrap();
        let mut rng = SmallRng::seed_from_u64(11);
        let mut particle = start();
        let mut draws = Vec::with_capacity(50_000);
        for _ in 0..50_000 {
            particle = kernel
                .apply(&Identity, &gap, &proposal, particle, f64::INFINITY, &mut rng)
                .unwrap()
                .particle;
            draws.push(particle.theta[0]);
        }
        let n = draws.len() as f64;
        let mean = draws.iter().sum::<f64>() / n;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        assert!((mean - 0.5).abs() < 0.02, "chain mean {mean}");
        assert!((var - 1.0 / 12.0).abs() < 0.008, "chain variance {var}");
    }

    #[test]
    fn nan_distance_is_an_error() {
        let kernel = RHitKernel::new(1, 5).unwrap();
        let proposal = RandomWalkProposal::new(0.01);
        let mut rng = SmallRng::seed_from_u64(1);
        let nan = |_: &f64| -> Result<f64> { Ok(f64::NAN) };
        let res = kernel.apply(&Identity, &nan, &proposal, start(), 1.0, &mut rng);
        assert!(matches!(res, Err(AbcError::Numerical(_))));
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(RHitKernel::new(0, 10).is_err());
        assert!(RHitKernel::new(5, 4).is_err());
    }
}
