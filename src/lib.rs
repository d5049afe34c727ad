pub mod core;
pub mod cost;
pub mod distance;
pub mod distributions;
pub mod error;
pub mod hilbert;
pub mod rhit;
pub mod sinkhorn;
pub mod smc;
pub mod stats;
pub mod swap;
pub mod transport;

pub use error::{AbcError, NumericalWarning, Result};
