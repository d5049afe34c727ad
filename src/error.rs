//! Error and warning types shared by the distance engines and the sampler.
//!
//! [`AbcError`] covers everything that aborts a computation: malformed samples,
//! infeasible marginals, out-of-range configuration values. These are detected
//! before any simulation budget is spent wherever possible.
//!
//! [`NumericalWarning`] covers conditions that degrade a result without
//! invalidating it. They are logged through the [`log`] facade and returned
//! alongside the value so callers can decide what to do with them.

use std::fmt;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AbcError>;

/// Fatal errors raised by the distance engines, proposals and the sampler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AbcError {
    /// The two samples (or a sample and a weight vector) disagree on dimensionality.
    #[error("dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// An engine that rank-matches points received samples of different sizes.
    #[error("sample sizes differ: {left} points vs {right} points")]
    SizeMismatch { left: usize, right: usize },

    /// Marginal weights are negative, non-finite, or do not sum to one.
    #[error("infeasible marginals: {0}")]
    InfeasibleMarginals(String),

    /// A configuration value is missing or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A sample with no points was passed where at least one is required.
    #[error("empty sample")]
    EmptySample,

    /// The transportation simplex hit its pivot cap before proving optimality.
    #[error("exact transport solver stalled after {0} pivots")]
    SolverStalled(usize),

    /// A numerical routine (e.g. a Cholesky factorisation) could not proceed.
    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl AbcError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        AbcError::InvalidConfig(msg.into())
    }
}

/// Non-fatal numerical conditions surfaced by the approximate engines.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericalWarning {
    /// Sinkhorn's plan lost mass to underflow; `mass` is the total that survived.
    SinkhornMassUnderflow { eps: f64, mass: f64 },
    /// The debiased Sinkhorn value came out negative.
    NegativeCorrectedDistance { value: f64 },
    /// The swap heuristic used its whole pass budget without reaching a local optimum.
    SwapNotConverged { passes: usize },
}

impl fmt::Display for NumericalWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericalWarning::SinkhornMassUnderflow { eps, mass } => write!(
                f,
                "sinkhorn plan mass underflowed to {mass:.3e} with eps={eps:.3e}; \
                 increase eps or the iteration count"
            ),
            NumericalWarning::NegativeCorrectedDistance { value } => {
                write!(f, "debiased sinkhorn distance is negative ({value:.3e})")
            }
            NumericalWarning::SwapNotConverged { passes } => {
                write!(f, "swap heuristic did not converge within {passes} passes")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_context() {
        let err = AbcError::DimensionMismatch {
            expected: 2,
            found: 3,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 2, got 3");

        let err = AbcError::SizeMismatch { left: 4, right: 5 };
        assert!(err.to_string().contains("4 points vs 5 points"));
    }

    #[test]
    fn warnings_display() {
        let w = NumericalWarning::SwapNotConverged { passes: 10 };
        assert_eq!(
            w.to_string(),
            "swap heuristic did not converge within 10 passes"
        );
    }
}
