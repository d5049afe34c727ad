/*!
# Hilbert-sort surrogate distance

Orders both samples along a Hilbert space-filling curve over the bounding box
that contains them, then matches points by rank. Because the curve preserves
locality, the rank matching is usually close to the optimal assignment, and
since it is *a* feasible matching its cost always upper-bounds the exact
transport distance. Runs in O(n log n).

Indices are computed with Skilling's transpose algorithm (J. Skilling,
"Programming the Hilbert curve", 2004) at [`HILBERT_ORDER`] bits per axis, and
kept as interleaved bit strings packed into `u64` words, so any dimension works.

```rust
use ndarray::arr2;
use winference::hilbert::HilbertSort;

let a = arr2(&[[0.0], [10.0]]);
let b = arr2(&[[9.0], [1.0]]);
let d = HilbertSort::new(1.0, 1.0).distance(a.view(), b.view()).unwrap();
assert!((d - 1.0).abs() < 1e-12);
```
*/

use ndarray::ArrayView2;

use crate::cost::{check_samples, CostMatrixBuilder, GroundNorm};
use crate::error::{AbcError, Result};

/// Bits per axis of the quantisation grid.
pub const HILBERT_ORDER: u32 = 16;

/// Rank-matching distance along the Hilbert curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HilbertSort {
    /// Transport exponent.
    pub p: f64,
    /// Pointwise ground cost.
    pub ground: CostMatrixBuilder,
}

impl HilbertSort {
    pub fn new(p: f64, ground_p: f64) -> Self {
        Self {
            p,
            ground: CostMatrixBuilder::new(ground_p),
        }
    }

    pub fn with_norm(mut self, norm: GroundNorm) -> Self {
        self.ground.norm = norm;
        self
    }

    /// `((1/n) Σ_k ‖a_(k) − b_(k)‖^ground_p)^(1/p)` over Hilbert-rank-matched pairs.
    pub fn distance(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<f64> {
        if !(self.p >= 1.0) || !(self.ground.ground_p >= 1.0) {
            return Err(AbcError::config("p and ground_p must be >= 1"));
        }
        let matching = hilbert_matching(a, b)?;
        let total: f64 = matching
            .iter()
            .enumerate()
            .map(|(i, &j)| self.ground.point_cost(a.row(i), b.row(j)))
            .sum();
        Ok((total / a.nrows() as f64).powf(1.0 / self.p))
    }
}

/// Shorthand for `HilbertSort::new(p, ground_p).distance(a, b)`.
pub fn hilbert_distance(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    p: f64,
    ground_p: f64,
) -> Result<f64> {
    HilbertSort::new(p, ground_p).distance(a, b)
}

/// Matches `a[i]` with `b[matching[i]]` by Hilbert rank. Requires equal sizes.
pub fn hilbert_matching(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Vec<usize>> {
    check_samples(a, b)?;
    if a.nrows() != b.nrows() {
        return Err(AbcError::SizeMismatch {
            left: a.nrows(),
            right: b.nrows(),
        });
    }
    let (lower, upper) = bounding_box(a, b);
    let order_a = hilbert_order(a, &lower, &upper);
    let order_b = hilbert_order(b, &lower, &upper);
    let mut matching = vec![0usize; a.nrows()];
    for (&i, &j) in order_a.iter().zip(order_b.iter()) {
        matching[i] = j;
    }
    Ok(matching)
}

/// Per-coordinate bounds of the union of two samples.
pub fn bounding_box(a: ArrayView2<f64>, b: ArrayView2<f64>) -> (Vec<f64>, Vec<f64>) {
    let d = a.ncols();
    let mut lower = vec![f64::INFINITY; d];
    let mut upper = vec![f64::NEG_INFINITY; d];
    for row in a.outer_iter().chain(b.outer_iter()) {
        for (k, &x) in row.iter().enumerate() {
            lower[k] = lower[k].min(x);
            upper[k] = upper[k].max(x);
        }
    }
    (lower, upper)
}

/// Indices of `points` sorted by Hilbert index within the box `[lower, upper]`.
/// Ties keep their original order.
pub fn hilbert_order(points: ArrayView2<f64>, lower: &[f64], upper: &[f64]) -> Vec<usize> {
    let keys: Vec<Vec<u64>> = points
        .outer_iter()
        .map(|row| {
            let mut axes: Vec<u32> = row
                .iter()
                .enumerate()
                .map(|(k, &x)| quantise(x, lower[k], upper[k]))
                .collect();
            axes_to_transpose(&mut axes, HILBERT_ORDER);
            interleave(&axes, HILBERT_ORDER)
        })
        .collect();
    let mut order: Vec<usize> = (0..points.nrows()).collect();
    order.sort_by(|&i, &j| keys[i].cmp(&keys[j]));
    order
}

fn quantise(x: f64, lo: f64, hi: f64) -> u32 {
    let max = ((1u64 << HILBERT_ORDER) - 1) as f64;
    let span = hi - lo;
    if !(span > 0.0) {
        return 0;
    }
    (((x - lo) / span).clamp(0.0, 1.0) * max).round() as u32
}

/// Skilling's in-place conversion from axis coordinates to the transposed
/// Hilbert index.
fn axes_to_transpose(x: &mut [u32], bits: u32) {
    let n = x.len();
    if n == 0 {
        return;
    }
    let m = 1u32 << (bits - 1);

    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode.
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for xi in x.iter_mut() {
        *xi ^= t;
    }
}

/// Packs the transposed index into big-endian `u64` words, most significant bit first.
fn interleave(x: &[u32], bits: u32) -> Vec<u64> {
    let total = x.len() * bits as usize;
    let mut words = vec![0u64; total.div_ceil(64)];
    let mut pos = 0usize;
    for bit in (0..bits).rev() {
        for xi in x {
            if (xi >> bit) & 1 == 1 {
                words[pos / 64] |= 1u64 << (63 - pos % 64);
            }
            pos += 1;
        }
    }
    words
}
