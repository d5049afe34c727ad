//! Provides empirical statistics over parameter populations and the resampling
//! primitives used by the SMC sampler.

use std::cmp::Ordering;

use ndarray::prelude::*;
use ndarray_stats::CorrelationExt;
use rand::Rng;

use crate::error::{AbcError, Result};

/// Relative diagonal jitter tried when a covariance is not numerically positive definite.
const CHOLESKY_JITTER: [f64; 4] = [0.0, 1e-10, 1e-8, 1e-6];

/// Column means of an `n × d` population.
pub fn mean(thetas: ArrayView2<f64>) -> Result<Array1<f64>> {
    thetas.mean_axis(Axis(0)).ok_or(AbcError::EmptySample)
}

/// Unbiased `d × d` covariance of an `n × d` population. A single row gives a zero matrix.
pub fn covariance(thetas: ArrayView2<f64>) -> Result<Array2<f64>> {
    let (n, d) = thetas.dim();
    if n == 0 {
        return Err(AbcError::EmptySample);
    }
    if n < 2 {
        return Ok(Array2::zeros((d, d)));
    }
    thetas
        .t()
        .cov(1.0)
        .map_err(|e| AbcError::Numerical(format!("covariance failed: {e}")))
}

/// Lower-triangular Cholesky factor `L` with `L Lᵀ = cov`.
///
/// Retries with growing diagonal jitter (relative to the mean variance) and
/// finally falls back to the square root of the diagonal, so degenerate
/// populations, e.g. after a collapse onto a few distinct values, still
/// yield a usable factor.
pub fn cholesky(cov: ArrayView2<f64>) -> Result<Array2<f64>> {
    let d = cov.nrows();
    if cov.ncols() != d {
        return Err(AbcError::DimensionMismatch {
            expected: d,
            found: cov.ncols(),
        });
    }
    let mean_var = cov.diag().sum() / d as f64;
    if !(mean_var > 0.0) || !mean_var.is_finite() {
        return Err(AbcError::Numerical(
            "covariance has no positive variance".into(),
        ));
    }
    for jitter in CHOLESKY_JITTER {
        let mut shifted = cov.to_owned();
        shifted.diag_mut().mapv_inplace(|x| x + jitter * mean_var);
        if let Some(l) = try_cholesky(shifted.view()) {
            return Ok(l);
        }
    }
    let diag = cov.diag().mapv(|x| x.max(0.0).sqrt());
    Ok(Array2::from_diag(&diag))
}

fn try_cholesky(a: ArrayView2<f64>) -> Option<Array2<f64>> {
    let d = a.nrows();
    let mut l = Array2::<f64>::zeros((d, d));
    for j in 0..d {
        let mut s = a[[j, j]];
        for k in 0..j {
            s -= l[[j, k]] * l[[j, k]];
        }
        if s <= 0.0 || !s.is_finite() {
            return None;
        }
        let ljj = s.sqrt();
        l[[j, j]] = ljj;
        for i in (j + 1)..d {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / ljj;
        }
    }
    Some(l)
}

/// Solves `L x = b` for lower-triangular `L`.
pub fn forward_substitute(l: ArrayView2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let d = b.len();
    let mut x = Array1::<f64>::zeros(d);
    for i in 0..d {
        let mut s = b[i];
        for k in 0..i {
            s -= l[[i, k]] * x[k];
        }
        x[i] = s / l[[i, i]];
    }
    x
}

/// Distinct values of `values` in increasing order (exact equality).
pub fn distinct_sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    sorted
}

/// Number of distinct rows of an `n × d` population (exact equality).
pub fn distinct_rows(thetas: ArrayView2<f64>) -> usize {
    let mut rows: Vec<ArrayView1<f64>> = thetas.outer_iter().collect();
    rows.sort_by(|a, b| lexicographic(a, b));
    rows.dedup_by(|a, b| lexicographic(a, b).is_eq());
    rows.len()
}

fn lexicographic(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Smallest count `k` with `k >= fraction · n`, at least 1.
///
/// Products such as `0.14 · 50` land just above the integer in floating
/// point, so a small slack is removed before rounding up.
pub fn min_count(fraction: f64, n: usize) -> usize {
    ((fraction * n as f64 - 1e-9).ceil().max(1.0)) as usize
}

/**
Systematic resampling of `n` indices from `k` equally weighted candidates.

Each candidate receives either `⌊n/k⌋` or `⌈n/k⌉` copies, so every candidate
survives whenever `k <= n`. The output is sorted.

```rust
use rand::rngs::SmallRng;
use rand::SeedableRng;
use winference::stats::systematic_resample;

let mut rng = SmallRng::seed_from_u64(1);
let idx = systematic_resample(3, 7, &mut rng);
assert_eq!(idx.len(), 7);
for c in 0..3 {
    let copies = idx.iter().filter(|&&i| i == c).count();
    assert!(copies == 2 || copies == 3);
}
```
*/
pub fn systematic_resample<R: Rng + ?Sized>(k: usize, n: usize, rng: &mut R) -> Vec<usize> {
    if k == 0 {
        return Vec::new();
    }
    let u: f64 = rng.gen();
    (0..n)
        .map(|i| {
            let position = (u + i as f64) / n as f64;
            ((position * k as f64).floor() as usize).min(k - 1)
        })
        .collect()
}
