/*!
# Ground cost matrices

Builds the n×m matrix of pairwise ground costs between two samples. A sample is
an `Array2<f64>` with one point per row; the two samples may have a different
number of rows but must agree on the number of columns.

```rust
use ndarray::arr2;
use winference::cost::{CostMatrixBuilder, GroundNorm};

let a = arr2(&[[0.0], [10.0]]);
let b = arr2(&[[1.0], [9.0]]);
let cost = CostMatrixBuilder::new(1.0).build(a.view(), b.view()).unwrap();
assert_eq!(cost, arr2(&[[1.0, 9.0], [9.0, 1.0]]));

let squared = CostMatrixBuilder::new(2.0)
    .with_norm(GroundNorm::Euclidean)
    .build(a.view(), b.view())
    .unwrap();
assert_eq!(squared[[0, 1]], 81.0);
```
*/

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::error::{AbcError, Result};

/// Norm used to measure the distance between two individual points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroundNorm {
    /// L2 norm.
    #[default]
    Euclidean,
    /// L1 norm.
    Manhattan,
    /// L∞ norm.
    Chebyshev,
}

impl GroundNorm {
    /// Evaluates ‖x − y‖ under this norm.
    pub fn norm(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        let diffs = x.iter().zip(y.iter()).map(|(a, b)| (a - b).abs());
        match self {
            GroundNorm::Euclidean => diffs.map(|d| d * d).sum::<f64>().sqrt(),
            GroundNorm::Manhattan => diffs.sum(),
            GroundNorm::Chebyshev => diffs.fold(0.0, f64::max),
        }
    }
}

/// Builds ground cost matrices `C[i, j] = ‖a_i − b_j‖^ground_p`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostMatrixBuilder {
    /// Exponent applied to the pointwise norm. Must be at least 1.
    pub ground_p: f64,
    /// Pointwise norm.
    pub norm: GroundNorm,
}

impl Default for CostMatrixBuilder {
    fn default() -> Self {
        Self {
            ground_p: 2.0,
            norm: GroundNorm::Euclidean,
        }
    }
}

impl CostMatrixBuilder {
    /// Creates a builder using the Euclidean norm raised to `ground_p`.
    pub fn new(ground_p: f64) -> Self {
        Self {
            ground_p,
            norm: GroundNorm::Euclidean,
        }
    }

    /// Replaces the pointwise norm.
    pub fn with_norm(mut self, norm: GroundNorm) -> Self {
        self.norm = norm;
        self
    }

    /// Ground cost between two single points.
    pub fn point_cost(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        let d = self.norm.norm(x, y);
        if self.ground_p == 1.0 {
            d
        } else {
            d.powf(self.ground_p)
        }
    }

    /// Computes the full n×m cost matrix between `a` (n points) and `b` (m points).
    ///
    /// Fails with [`AbcError::DimensionMismatch`] if the samples have a different
    /// number of columns and with [`AbcError::EmptySample`] if either is empty.
    pub fn build(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>> {
        check_samples(a, b)?;
        if !(self.ground_p >= 1.0) {
            return Err(AbcError::config(format!(
                "ground_p must be >= 1, got {}",
                self.ground_p
            )));
        }
        let mut cost = Array2::<f64>::zeros((a.nrows(), b.nrows()));
        for (i, ai) in a.outer_iter().enumerate() {
            for (j, bj) in b.outer_iter().enumerate() {
                cost[[i, j]] = self.point_cost(ai, bj);
            }
        }
        Ok(cost)
    }
}

/// Checks that two samples are non-empty and share their point dimension.
pub(crate) fn check_samples(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<()> {
    if a.nrows() == 0 || b.nrows() == 0 {
        return Err(AbcError::EmptySample);
    }
    if a.ncols() != b.ncols() {
        return Err(AbcError::DimensionMismatch {
            expected: a.ncols(),
            found: b.ncols(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn rectangular_cost_matrix() {
        let a = arr2(&[[0.0, 0.0], [1.0, 1.0], [2.0, 0.0]]);
        let b = arr2(&[[0.0, 1.0], [3.0, 4.0]]);
        let cost = CostMatrixBuilder::new(1.0).build(a.view(), b.view()).unwrap();
        assert_eq!(cost.dim(), (3, 2));
        assert_abs_diff_eq!(cost[[0, 0]], 1.0);
        assert_abs_diff_eq!(cost[[0, 1]], 5.0);
        assert_abs_diff_eq!(cost[[2, 0]], 5.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn reversed_samples_give_transpose() {
        let a = arr2(&[[0.0], [2.0], [5.0]]);
        let b = arr2(&[[1.0], [4.0]]);
        let builder = CostMatrixBuilder::new(2.0);
        let ab = builder.build(a.view(), b.view()).unwrap();
        let ba = builder.build(b.view(), a.view()).unwrap();
        assert_eq!(ab.t(), ba);
    }

    #[test]
    fn norms_differ() {
        let a = arr2(&[[0.0, 0.0]]);
        let b = arr2(&[[3.0, 4.0]]);
        let l1 = CostMatrixBuilder::new(1.0).with_norm(GroundNorm::Manhattan);
        let linf = CostMatrixBuilder::new(1.0).with_norm(GroundNorm::Chebyshev);
        assert_eq!(l1.build(a.view(), b.view()).unwrap()[[0, 0]], 7.0);
        assert_eq!(linf.build(a.view(), b.view()).unwrap()[[0, 0]], 4.0);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let a = arr2(&[[0.0, 0.0]]);
        let b = arr2(&[[0.0]]);
        let err = CostMatrixBuilder::default()
            .build(a.view(), b.view())
            .unwrap_err();
        assert_eq!(
            err,
            AbcError::DimensionMismatch {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn ground_p_below_one_is_rejected() {
        let a = arr2(&[[0.0]]);
        let err = CostMatrixBuilder::new(0.5)
            .build(a.view(), a.view())
            .unwrap_err();
        assert!(matches!(err, AbcError::InvalidConfig(_)));
    }
}
