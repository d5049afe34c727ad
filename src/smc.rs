/*!
# Adaptive ABC-SMC sampler

Maintains a population of `nthetas` particles under a shrinking distance
threshold. Initialisation draws from the prior and sets τ₀ to the largest
initial distance, so every particle starts admissible. Each step then

1. picks τₜ with a [`ThresholdPolicy`], stopping on [`TerminationReason::DiversityCollapse`]
   when no threshold strictly below τₜ₋₁ is admissible;
2. resamples `nthetas` particles systematically among those with distance ≤ τₜ,
   also stopping on diversity collapse when those share a single parameter;
3. fits the proposal to the resampled parameters;
4. applies the [`RHitKernel`] `nmoves` times to every particle, in parallel,
   each particle drawing from its own `SmallRng` seeded with `step_seed + i`;
5. appends a [`StepRecord`] to the [`RunHistory`].

Budgets (steps, wall time, simulations) are checked between steps only, and a
step in which the fraction of stuck particles reaches `minimum_diversity`
ends the run with [`TerminationReason::StuckParticles`]. A terminated run can
be continued with [`AbcSmc::resume`] under a fresh [`Budget`].

Runs are reproducible: for a fixed `seed` the history is identical whether or
not `parallel` is set.

```rust
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use winference::distributions::{Model, RandomWalkProposal};
use winference::smc::{AbcSmc, SmcConfig};
use winference::Result;

struct Location;

impl Model for Location {
    type Data = f64;

    fn dim(&self) -> usize {
        1
    }

    fn rprior<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f64> {
        Array2::from_shape_fn((n, 1), |_| rng.gen_range(-5.0..5.0))
    }

    fn dprior(&self, thetas: ArrayView2<f64>) -> Array1<f64> {
        thetas
            .column(0)
            .mapv(|t| if t.abs() <= 5.0 { 0.0 } else { f64::NEG_INFINITY })
    }

    fn simulate<R: Rng + ?Sized>(&self, theta: ArrayView1<f64>, rng: &mut R) -> f64 {
        theta[0] + 0.1 * (rng.gen::<f64>() - 0.5)
    }
}

let config = SmcConfig {
    nthetas: 64,
    maxstep: Some(6),
    maxsimulation: None,
    ..SmcConfig::default()
};
let distance = |y: &f64| -> Result<f64> { Ok((y - 1.0).abs()) };
let mut smc = AbcSmc::new(Location, distance, RandomWalkProposal::new(1.0), config).unwrap();
let history = smc.run().unwrap();
let mean = history.posterior_mean().unwrap();
assert!((mean[0] - 1.0).abs() < 0.5);
```
*/

use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::core::{seeded_map, step_progress};
use crate::distance::Discrepancy;
use crate::distributions::{Model, Proposal};
use crate::error::{AbcError, Result};
use crate::rhit::{checked, MoveOutcome, RHitKernel};
use crate::stats;

/// A weighted parameter with its simulated dataset and distance.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle<D> {
    pub theta: Array1<f64>,
    pub data: D,
    pub distance: f64,
    pub weight: f64,
}

/// Sampler configuration, checked once by [`SmcConfig::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct SmcConfig {
    /// Population size.
    pub nthetas: usize,
    /// Kernel applications per particle per step.
    pub nmoves: usize,
    /// Fraction of `nthetas` that must stay distinct; also the stuck-fraction limit.
    pub minimum_diversity: f64,
    /// Hits required per kernel application.
    pub r: usize,
    /// Proposal cap per kernel application.
    pub maxtrials: usize,
    pub maxtime: Option<Duration>,
    /// Cap on simulator calls, initialisation included.
    pub maxsimulation: Option<usize>,
    /// Cap on SMC steps after initialisation.
    pub maxstep: Option<usize>,
    pub seed: u64,
    pub parallel: bool,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            nthetas: 256,
            nmoves: 1,
            minimum_diversity: 0.5,
            r: 2,
            maxtrials: 1_000,
            maxtime: None,
            maxsimulation: Some(1_000_000),
            maxstep: None,
            seed: 42,
            parallel: true,
        }
    }
}

impl SmcConfig {
    /// Rejects out-of-range values, and a configuration without any budget.
    pub fn validate(&self) -> Result<()> {
        if self.nthetas < 2 {
            return Err(AbcError::config(format!(
                "nthetas must be at least 2, got {}",
                self.nthetas
            )));
        }
        if self.nmoves == 0 {
            return Err(AbcError::config("nmoves must be at least 1"));
        }
        if !(self.minimum_diversity > 0.0 && self.minimum_diversity <= 1.0) {
            return Err(AbcError::config(format!(
                "minimum_diversity must lie in (0, 1], got {}",
                self.minimum_diversity
            )));
        }
        RHitKernel::new(self.r, self.maxtrials)?;
        self.budget().validate()
    }

    /// The budget a fresh [`AbcSmc::run`] works under.
    pub fn budget(&self) -> Budget {
        Budget {
            maxstep: self.maxstep,
            maxtime: self.maxtime,
            maxsimulation: self.maxsimulation,
        }
    }
}

/// Limits on a run or a resumption. At least one must be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    pub maxstep: Option<usize>,
    pub maxtime: Option<Duration>,
    pub maxsimulation: Option<usize>,
}

impl Budget {
    pub fn steps(n: usize) -> Self {
        Self {
            maxstep: Some(n),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.maxstep.is_none() && self.maxtime.is_none() && self.maxsimulation.is_none() {
            return Err(AbcError::config(
                "at least one of maxstep, maxtime or maxsimulation must be set",
            ));
        }
        if self.maxtime.is_some_and(|t| t.is_zero()) {
            return Err(AbcError::config("maxtime must be positive"));
        }
        Ok(())
    }

    fn exhausted(
        &self,
        steps: usize,
        elapsed: Duration,
        simulations: usize,
    ) -> Option<TerminationReason> {
        if self.maxsimulation.is_some_and(|m| simulations >= m) {
            Some(TerminationReason::SimulationBudget)
        } else if self.maxtime.is_some_and(|m| elapsed >= m) {
            Some(TerminationReason::TimeBudget)
        } else if self.maxstep.is_some_and(|m| steps >= m) {
            Some(TerminationReason::StepBudget)
        } else {
            None
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminationReason {
    /// No admissible threshold below the current one, or the survivors
    /// below it share one parameter.
    DiversityCollapse,
    /// The fraction of particles that missed their `r` hits reached `minimum_diversity`.
    StuckParticles { fraction: f64 },
    SimulationBudget,
    TimeBudget,
    StepBudget,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    Initializing,
    Stepping,
    Terminated(TerminationReason),
}

/// One entry of the run history. Step 0 is the prior population.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// `nthetas × dim`.
    pub thetas: Array2<f64>,
    pub distances: Array1<f64>,
    pub threshold: f64,
    /// Simulator calls made during this step.
    pub nsimulations: usize,
    pub stuck_fraction: f64,
    /// Hits over trials across all kernel applications of the step.
    pub acceptance_rate: f64,
    pub elapsed: Duration,
}

/// Append-only record of a run, plus the datasets of the latest population.
#[derive(Debug, Clone)]
pub struct RunHistory<D> {
    steps: Vec<StepRecord>,
    final_datasets: Vec<D>,
    status: Status,
}

impl<D> RunHistory<D> {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            final_datasets: Vec::new(),
            status: Status::Initializing,
        }
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    pub fn thresholds(&self) -> Vec<f64> {
        self.steps.iter().map(|s| s.threshold).collect()
    }

    pub fn total_simulations(&self) -> usize {
        self.steps.iter().map(|s| s.nsimulations).sum()
    }

    pub fn final_datasets(&self) -> &[D] {
        &self.final_datasets
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Mean of the latest population, equally weighted.
    pub fn posterior_mean(&self) -> Option<Array1<f64>> {
        self.last().and_then(|s| s.thetas.mean_axis(Axis(0)))
    }
}

/// Chooses the next threshold from the current distances.
pub trait ThresholdPolicy {
    /// Returns `None` when no threshold strictly below `previous` is admissible.
    fn next_threshold(&self, distances: &[f64], previous: f64) -> Option<f64>;
}

/// Smallest distance value that keeps at least `⌈minimum_diversity · n⌉`
/// distinct distance values at or below it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiversityPolicy {
    pub minimum_diversity: f64,
}

impl DiversityPolicy {
    pub fn new(minimum_diversity: f64) -> Self {
        Self { minimum_diversity }
    }
}

impl ThresholdPolicy for DiversityPolicy {
    fn next_threshold(&self, distances: &[f64], previous: f64) -> Option<f64> {
        let distinct = stats::distinct_sorted(distances);
        let needed = stats::min_count(self.minimum_diversity, distances.len());
        let tau = *distinct.get(needed - 1)?;
        (tau < previous).then_some(tau)
    }
}

/// The `alpha`-quantile of the current distances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantilePolicy {
    pub alpha: f64,
}

impl ThresholdPolicy for QuantilePolicy {
    fn next_threshold(&self, distances: &[f64], previous: f64) -> Option<f64> {
        if distances.is_empty() {
            return None;
        }
        let mut sorted = distances.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let k = stats::min_count(self.alpha, n).min(n);
        let tau = sorted[k - 1];
        (tau < previous).then_some(tau)
    }
}

/// The ABC-SMC sampler. See the [module documentation](self).
pub struct AbcSmc<M: Model, Dist, Q, P = DiversityPolicy> {
    model: M,
    discrepancy: Dist,
    proposal: Q,
    policy: P,
    config: SmcConfig,
    kernel: RHitKernel,
    rng: SmallRng,
    population: Vec<Particle<M::Data>>,
    threshold: f64,
    history: RunHistory<M::Data>,
}

impl<M, Dist, Q> AbcSmc<M, Dist, Q, DiversityPolicy>
where
    M: Model,
    Dist: Discrepancy<M::Data>,
    Q: Proposal,
{
    /// Validates `config`; nothing is simulated until [`AbcSmc::run`].
    pub fn new(model: M, discrepancy: Dist, proposal: Q, config: SmcConfig) -> Result<Self> {
        config.validate()?;
        let kernel = RHitKernel::new(config.r, config.maxtrials)?;
        Ok(Self {
            model,
            discrepancy,
            proposal,
            policy: DiversityPolicy::new(config.minimum_diversity),
            kernel,
            rng: SmallRng::seed_from_u64(config.seed),
            config,
            population: Vec::new(),
            threshold: f64::INFINITY,
            history: RunHistory::new(),
        })
    }
}

impl<M, Dist, Q, P> AbcSmc<M, Dist, Q, P>
where
    M: Model,
    Dist: Discrepancy<M::Data>,
    Q: Proposal,
    P: ThresholdPolicy,
{
    /// Replaces the threshold rule.
    pub fn with_policy<P2: ThresholdPolicy>(self, policy: P2) -> AbcSmc<M, Dist, Q, P2> {
        AbcSmc {
            model: self.model,
            discrepancy: self.discrepancy,
            proposal: self.proposal,
            policy,
            config: self.config,
            kernel: self.kernel,
            rng: self.rng,
            population: self.population,
            threshold: self.threshold,
            history: self.history,
        }
    }

    pub fn config(&self) -> &SmcConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn history(&self) -> &RunHistory<M::Data> {
        &self.history
    }

    pub fn into_history(self) -> RunHistory<M::Data> {
        self.history
    }

    pub fn status(&self) -> Status {
        self.history.status
    }

    pub fn population(&self) -> &[Particle<M::Data>] {
        &self.population
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Initialises from the prior and steps until the configured budget, a
    /// diversity collapse or too many stuck particles stops the run.
    pub fn run(&mut self) -> Result<&RunHistory<M::Data>> {
        self.run_inner(None)
    }

    /// Same as [`AbcSmc::run`], with a progress bar over steps.
    pub fn run_progress(&mut self) -> Result<&RunHistory<M::Data>> {
        let pb = step_progress(self.config.maxstep);
        let result = self.run_inner(Some(&pb));
        pb.finish_with_message("Done!");
        result
    }

    /// Continues a terminated run under `budget`. The simulation cap counts
    /// simulator calls from this call onwards; earlier records are kept.
    pub fn resume(&mut self, budget: Budget) -> Result<&RunHistory<M::Data>> {
        if self.population.is_empty() {
            return Err(AbcError::config("nothing to resume; call run() first"));
        }
        budget.validate()?;
        let baseline = self.history.total_simulations();
        self.advance(&budget, Instant::now(), baseline, None)?;
        Ok(&self.history)
    }

    fn run_inner(&mut self, pb: Option<&ProgressBar>) -> Result<&RunHistory<M::Data>> {
        if self.history.status != Status::Initializing {
            return Err(AbcError::config("run() was already called; use resume()"));
        }
        let start = Instant::now();
        self.initialize()?;
        let budget = self.config.budget();
        self.advance(&budget, start, 0, pb)?;
        Ok(&self.history)
    }

    fn initialize(&mut self) -> Result<()> {
        let start = Instant::now();
        let n = self.config.nthetas;
        let dim = self.model.dim();
        let thetas = self.model.rprior(n, &mut self.rng);
        if thetas.ncols() != dim {
            return Err(AbcError::DimensionMismatch {
                expected: dim,
                found: thetas.ncols(),
            });
        }
        if thetas.nrows() != n {
            return Err(AbcError::SizeMismatch {
                left: n,
                right: thetas.nrows(),
            });
        }

        let seed: u64 = self.rng.gen();
        let weight = 1.0 / n as f64;
        let (model, discrepancy) = (&self.model, &self.discrepancy);
        let items: Vec<Array1<f64>> = thetas.outer_iter().map(|row| row.to_owned()).collect();
        let scored = seeded_map(items, seed, self.config.parallel, |_, theta, rng| {
            let data = model.simulate(theta.view(), rng);
            let distance = checked(discrepancy.distance(&data)?)?;
            Ok(Particle {
                theta,
                data,
                distance,
                weight,
            })
        });
        self.population = scored.into_iter().collect::<Result<Vec<_>>>()?;

        let distances = self.distances();
        self.threshold = *distances
            .max()
            .map_err(|e| AbcError::Numerical(format!("initial threshold: {e}")))?;
        self.record(self.threshold, n, 0.0, 1.0, start.elapsed())?;
        self.history.status = Status::Stepping;
        log::info!(
            "initialised {n} particles from the prior, threshold {:.4e}",
            self.threshold
        );
        Ok(())
    }

    fn advance(
        &mut self,
        budget: &Budget,
        start: Instant,
        baseline: usize,
        pb: Option<&ProgressBar>,
    ) -> Result<()> {
        self.history.status = Status::Stepping;
        let mut steps = 0;
        let reason = loop {
            let used = self.history.total_simulations() - baseline;
            if let Some(reason) = budget.exhausted(steps, start.elapsed(), used) {
                break reason;
            }
            if let Some(reason) = self.step()? {
                break reason;
            }
            steps += 1;
            if let Some(pb) = pb {
                pb.inc(1);
                pb.set_message(format!("threshold {:.3e}", self.threshold));
            }
        };
        log::info!(
            "stopped after {} steps ({} simulations): {reason:?}",
            self.history.len() - 1,
            self.history.total_simulations()
        );
        self.history.status = Status::Terminated(reason);
        Ok(())
    }

    /// One SMC step. Returns the reason to stop, if any.
    fn step(&mut self) -> Result<Option<TerminationReason>> {
        let start = Instant::now();
        let n = self.config.nthetas;
        let distances: Vec<f64> = self.population.iter().map(|p| p.distance).collect();
        let Some(threshold) = self.policy.next_threshold(&distances, self.threshold) else {
            log::info!(
                "no admissible threshold below {:.4e}; diversity collapsed",
                self.threshold
            );
            return Ok(Some(TerminationReason::DiversityCollapse));
        };

        let survivors: Vec<usize> = (0..n).filter(|&i| distances[i] <= threshold).collect();
        let survivor_thetas = Array2::from_shape_fn((survivors.len(), self.model.dim()), |(r, k)| {
            self.population[survivors[r]].theta[k]
        });
        // A single distinct θ cannot fit a proposal.
        if stats::distinct_rows(survivor_thetas.view()) < 2 {
            log::info!(
                "threshold {threshold:.4e} keeps {} particles sharing one parameter; diversity collapsed",
                survivors.len()
            );
            return Ok(Some(TerminationReason::DiversityCollapse));
        }
        let ancestors = stats::systematic_resample(survivors.len(), n, &mut self.rng);
        let weight = 1.0 / n as f64;
        let resampled: Vec<Particle<M::Data>> = ancestors
            .iter()
            .map(|&a| Particle {
                weight,
                ..self.population[survivors[a]].clone()
            })
            .collect();
        let proposal = self
            .proposal
            .fit(stack_thetas(&resampled, self.model.dim())?.view())?;

        let step_seed: u64 = self.rng.gen();
        let (model, discrepancy, kernel) = (&self.model, &self.discrepancy, self.kernel);
        let nmoves = self.config.nmoves;
        let moved = seeded_map(resampled, step_seed, self.config.parallel, |_, particle, rng| {
            let mut total = MoveOutcome {
                particle,
                nsimulations: 0,
                hits: 0,
                trials: 0,
                stuck: false,
            };
            for _ in 0..nmoves {
                let out = kernel.apply(model, discrepancy, &proposal, total.particle, threshold, rng)?;
                total = MoveOutcome {
                    particle: out.particle,
                    nsimulations: total.nsimulations + out.nsimulations,
                    hits: total.hits + out.hits,
                    trials: total.trials + out.trials,
                    stuck: total.stuck || out.stuck,
                };
            }
            Ok(total)
        });
        let moved = moved.into_iter().collect::<Result<Vec<_>>>()?;

        let nsimulations: usize = moved.iter().map(|m| m.nsimulations).sum();
        let hits: usize = moved.iter().map(|m| m.hits).sum();
        let trials: usize = moved.iter().map(|m| m.trials).sum();
        let stuck_fraction = moved.iter().filter(|m| m.stuck).count() as f64 / n as f64;
        let acceptance_rate = if trials > 0 {
            hits as f64 / trials as f64
        } else {
            0.0
        };

        self.population = moved.into_iter().map(|m| m.particle).collect();
        self.threshold = threshold;
        self.record(
            threshold,
            nsimulations,
            stuck_fraction,
            acceptance_rate,
            start.elapsed(),
        )?;
        log::info!(
            "step {}: threshold {threshold:.4e}, {nsimulations} simulations, \
             acceptance {acceptance_rate:.3}, stuck {stuck_fraction:.3}",
            self.history.len() - 1
        );

        if stuck_fraction >= self.config.minimum_diversity {
            log::warn!(
                "{:.1}% of particles missed their {} hits within {} trials",
                100.0 * stuck_fraction,
                self.kernel.r,
                self.kernel.maxtrials
            );
            return Ok(Some(TerminationReason::StuckParticles {
                fraction: stuck_fraction,
            }));
        }
        Ok(None)
    }

    fn distances(&self) -> Array1<f64> {
        self.population.iter().map(|p| p.distance).collect()
    }

    fn record(
        &mut self,
        threshold: f64,
        nsimulations: usize,
        stuck_fraction: f64,
        acceptance_rate: f64,
        elapsed: Duration,
    ) -> Result<()> {
        let record = StepRecord {
            thetas: stack_thetas(&self.population, self.model.dim())?,
            distances: self.distances(),
            threshold,
            nsimulations,
            stuck_fraction,
            acceptance_rate,
            elapsed,
        };
        self.history.steps.push(record);
        self.history.final_datasets = self.population.iter().map(|p| p.data.clone()).collect();
        Ok(())
    }
}

fn stack_thetas<D>(particles: &[Particle<D>], dim: usize) -> Result<Array2<f64>> {
    if let Some(bad) = particles.iter().find(|p| p.theta.len() != dim) {
        return Err(AbcError::DimensionMismatch {
            expected: dim,
            found: bad.theta.len(),
        });
    }
    Ok(Array2::from_shape_fn((particles.len(), dim), |(i, k)| {
        particles[i].theta[k]
    }))
}
