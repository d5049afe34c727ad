//! Execution helpers shared by the sampler: a seeded map that runs either on
//! the rayon pool or on the calling thread, and the progress bar style.

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;

/// Runs `f(i, item, rng)` for every item, where task `i` owns a `SmallRng`
/// seeded with `seed + i`. Results keep the input order, and the output does
/// not depend on `parallel`.
pub fn seeded_map<T, U, F>(items: Vec<T>, seed: u64, parallel: bool, f: F) -> Vec<U>
where
    T: Send,
    U: Send,
    F: Fn(usize, T, &mut SmallRng) -> U + Sync,
{
    let task = |(i, item): (usize, T)| {
        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
        f(i, item, &mut rng)
    };
    if parallel {
        items.into_par_iter().enumerate().map(task).collect()
    } else {
        items.into_iter().enumerate().map(task).collect()
    }
}

/// Progress bar over SMC steps. Without a step cap it counts up with no bar.
pub(crate) fn step_progress(maxstep: Option<usize>) -> ProgressBar {
    let (pb, template) = match maxstep {
        Some(n) => (
            ProgressBar::new(n as u64),
            "{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        ),
        None => (
            ProgressBar::new_spinner(),
            "{prefix} [{elapsed_precise}] {spinner} step {pos} {msg}",
        ),
    };
    let style = ProgressStyle::default_bar()
        .template(template)
        .map(|s| s.progress_chars("##-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix("SMC");
    pb
}
