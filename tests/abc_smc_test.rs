//! End-to-end runs of the ABC-SMC sampler on a one-dimensional location model:
//! uniform prior on [0, 1], data are 20 draws of θ plus small Gaussian noise,
//! compared with the exact Wasserstein-1 distance.

use ndarray::{arr1, Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::atomic::{AtomicUsize, Ordering};

use winference::distance::{Engine, TransportDistance};
use winference::distributions::{IndependentGaussianProposal, Model, RandomWalkProposal};
use winference::smc::{AbcSmc, SmcConfig};

const NOBS: usize = 20;
const NOISE: f64 = 0.05;
const TRUTH: f64 = 0.7;

#[derive(Default)]
struct NoisyLocation {
    simulations: AtomicUsize,
}

impl Model for NoisyLocation {
    type Data = Array2<f64>;

    fn dim(&self) -> usize {
        1
    }

    fn rprior<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f64> {
        Array2::from_shape_fn((n, 1), |_| rng.gen::<f64>())
    }

    fn dprior(&self, thetas: ArrayView2<f64>) -> Array1<f64> {
        thetas
            .column(0)
            .mapv(|t| if (0.0..=1.0).contains(&t) { 0.0 } else { f64::NEG_INFINITY })
    }

    fn simulate<R: Rng + ?Sized>(&self, theta: ArrayView1<f64>, rng: &mut R) -> Array2<f64> {
        self.simulations.fetch_add(1, Ordering::Relaxed);
        Array2::from_shape_fn((NOBS, 1), |_| {
            theta[0] + NOISE * rng.sample::<f64, _>(StandardNormal)
        })
    }
}

fn observed() -> Array2<f64> {
    NoisyLocation::default().simulate(arr1(&[TRUTH]).view(), &mut SmallRng::seed_from_u64(2024))
}

fn config(maxstep: usize, parallel: bool) -> SmcConfig {
    SmcConfig {
        nthetas: 50,
        maxstep: Some(maxstep),
        maxsimulation: None,
        maxtrials: 2_000,
        seed: 7,
        parallel,
        ..SmcConfig::default()
    }
}

fn sampler(
    config: SmcConfig,
) -> AbcSmc<NoisyLocation, TransportDistance, RandomWalkProposal> {
    let distance = TransportDistance::new(observed(), 1.0, 1.0, Engine::Exact).unwrap();
    AbcSmc::new(
        NoisyLocation::default(),
        distance,
        RandomWalkProposal::new(1.0),
        config,
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use winference::smc::{Budget, QuantilePolicy, Status, TerminationReason};
    use winference::AbcError;

    #[test]
    fn posterior_concentrates_on_truth() {
        let mut smc = sampler(config(8, true));
        let history = smc.run().unwrap();

        assert!(history.len() >= 4, "only {} records", history.len());
        let mean = history.posterior_mean().unwrap();
        assert!((mean[0] - TRUTH).abs() < 0.1, "posterior mean {}", mean[0]);

        let first = &history.steps()[0];
        let last = history.last().unwrap();
        let spread = |s: &winference::smc::StepRecord| {
            let m = s.thetas.mean_axis(ndarray::Axis(0)).unwrap()[0];
            s.thetas.mapv(|t| (t - m).abs()).mean().unwrap()
        };
        assert!(spread(last) < spread(first));
    }

    #[test]
    fn thresholds_are_non_increasing_and_population_size_is_fixed() {
        let mut smc = sampler(config(8, true));
        let history = smc.run().unwrap();

        let thresholds = history.thresholds();
        for w in thresholds.windows(2) {
            assert!(w[1] < w[0], "threshold went from {} to {}", w[0], w[1]);
        }
        for step in history.steps() {
            assert_eq!(step.thetas.nrows(), 50);
            assert_eq!(step.distances.len(), 50);
            assert!(step.distances.iter().all(|&d| d <= step.threshold));
        }
        assert_eq!(history.final_datasets().len(), 50);
        // τ₀ is the largest initial distance.
        let first = &history.steps()[0];
        assert_eq!(
            first.threshold,
            first.distances.iter().cloned().fold(f64::MIN, f64::max)
        );
    }

    #[test]
    fn simulation_count_is_exact() {
        let mut smc = sampler(config(5, true));
        smc.run().unwrap();
        let calls = smc.model().simulations.load(Ordering::Relaxed);
        assert_eq!(smc.history().total_simulations(), calls);
        assert_eq!(smc.history().steps()[0].nsimulations, 50);
    }

    #[test]
    fn parallel_and_sequential_runs_are_identical() {
        let mut par = sampler(config(4, true));
        let mut seq = sampler(config(4, false));
        let par = par.run().unwrap();
        let seq = seq.run().unwrap();
        assert_eq!(par.thresholds(), seq.thresholds());
        assert_eq!(par.len(), seq.len());
        for (a, b) in par.steps().iter().zip(seq.steps()) {
            assert_eq!(a.thetas, b.thetas);
            assert_eq!(a.distances, b.distances);
            assert_eq!(a.nsimulations, b.nsimulations);
        }
    }

    #[test]
    fn resume_appends_to_history() {
        let mut smc = sampler(config(3, true));
        smc.run().unwrap();
        assert_eq!(
            smc.status(),
            Status::Terminated(TerminationReason::StepBudget)
        );
        let before: Vec<_> = smc.history().steps().to_vec();
        assert_eq!(before.len(), 4);

        let history = smc.resume(Budget::steps(2)).unwrap();
        assert_eq!(history.len(), 6);
        assert_eq!(&history.steps()[..4], &before[..]);
        assert!(history.steps()[4].threshold < before[3].threshold);
        assert_eq!(
            history.status(),
            Status::Terminated(TerminationReason::StepBudget)
        );
    }

    #[test]
    fn resume_counts_simulations_from_the_resume_call() {
        let mut smc = sampler(config(2, true));
        smc.run().unwrap();
        let spent = smc.history().total_simulations();
        let budget = Budget {
            maxsimulation: Some(1),
            ..Budget::default()
        };
        // One step always runs before the budget is checked again.
        let history = smc.resume(budget).unwrap();
        assert_eq!(history.len(), 4);
        assert!(history.total_simulations() > spent);
        assert_eq!(
            history.status(),
            Status::Terminated(TerminationReason::SimulationBudget)
        );
    }

    #[test]
    fn run_and_resume_misuse_is_rejected() {
        let mut smc = sampler(config(1, true));
        assert!(matches!(
            smc.resume(Budget::steps(1)),
            Err(AbcError::InvalidConfig(_))
        ));
        smc.run().unwrap();
        assert!(matches!(smc.run(), Err(AbcError::InvalidConfig(_))));
        assert!(matches!(
            smc.resume(Budget::default()),
            Err(AbcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn construction_validates_without_simulating() {
        let model = NoisyLocation::default();
        let distance = TransportDistance::new(observed(), 1.0, 1.0, Engine::Exact).unwrap();
        let bad = SmcConfig {
            minimum_diversity: 1.5,
            ..config(3, true)
        };
        let result = AbcSmc::new(model, distance, RandomWalkProposal::new(1.0), bad);
        assert!(matches!(result.err(), Some(AbcError::InvalidConfig(_))));

        let model = NoisyLocation::default();
        let distance = TransportDistance::new(observed(), 1.0, 1.0, Engine::Exact).unwrap();
        let smc = AbcSmc::new(model, distance, RandomWalkProposal::new(1.0), config(3, true))
            .unwrap();
        assert!(smc.history().is_empty());
        assert_eq!(smc.status(), Status::Initializing);
        assert_eq!(smc.model().simulations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn constant_distance_collapses_diversity_immediately() {
        let constant = |_: &Array2<f64>| -> winference::Result<f64> { Ok(1.0) };
        let mut smc = AbcSmc::new(
            NoisyLocation::default(),
            constant,
            RandomWalkProposal::new(1.0),
            config(10, true),
        )
        .unwrap();
        let history = smc.run().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history.status(),
            Status::Terminated(TerminationReason::DiversityCollapse)
        );
    }

    #[test]
    fn single_survivor_collapses_diversity_cleanly() {
        // ⌈0.02 · 50⌉ = 1: only the closest particle survives the first threshold.
        let mut smc = sampler(SmcConfig {
            minimum_diversity: 1.0 / 50.0,
            ..config(5, true)
        });
        let history = smc.run().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history.status(),
            Status::Terminated(TerminationReason::DiversityCollapse)
        );
        assert_eq!(history.final_datasets().len(), 50);
    }

    #[test]
    fn tiny_quantile_with_independent_proposal_collapses_cleanly() {
        let distance = TransportDistance::new(observed(), 1.0, 1.0, Engine::Exact).unwrap();
        let mut smc = AbcSmc::new(
            NoisyLocation::default(),
            distance,
            IndependentGaussianProposal::new(1.0),
            config(5, true),
        )
        .unwrap()
        .with_policy(QuantilePolicy { alpha: 0.01 });
        let history = smc.run().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            smc.status(),
            Status::Terminated(TerminationReason::DiversityCollapse)
        );
    }

    #[test]
    fn tight_trial_cap_escalates_to_stuck_particles() {
        let mut smc = sampler(SmcConfig {
            r: 2,
            maxtrials: 2,
            ..config(10, true)
        });
        let history = smc.run().unwrap();
        match history.status() {
            Status::Terminated(TerminationReason::StuckParticles { fraction }) => {
                assert!(fraction >= 0.5);
                assert_eq!(history.last().unwrap().stuck_fraction, fraction);
            }
            other => panic!("expected stuck particles, got {other:?}"),
        }
    }

    #[test]
    fn quantile_policy_runs() {
        let mut smc = sampler(config(4, true)).with_policy(QuantilePolicy { alpha: 0.3 });
        let history = smc.run_progress().unwrap();
        assert_eq!(history.len(), 5);
        let thresholds = history.thresholds();
        assert!(thresholds.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn time_budget_stops_the_run() {
        let mut smc = sampler(SmcConfig {
            maxstep: None,
            maxtime: Some(Duration::from_nanos(1)),
            ..config(0, true)
        });
        let history = smc.run().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history.status(),
            Status::Terminated(TerminationReason::TimeBudget)
        );
    }
}
