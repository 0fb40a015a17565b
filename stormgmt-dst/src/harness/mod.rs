//! Simulation harnesses for stormgmt.
//!
//! Each harness drives a seeded random sequence of operations against the
//! real pool or lifecycle code, backed by the in-memory fakes, and checks the
//! outcome against a simple oracle.

pub mod pool;
pub mod volume;

pub use pool::{PoolAction, PoolHarness, PoolOracle, PoolSimStats};
pub use volume::{VolumeHarness, VolumeSimStats};

/// Error type for simulation failures.
#[derive(Debug)]
pub enum SimulationError {
    Mismatch { context: String },
    Unexpected(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch { context } => write!(f, "oracle mismatch: {context}"),
            Self::Unexpected(msg) => write!(f, "unexpected error: {msg}"),
        }
    }
}

impl std::error::Error for SimulationError {}

impl From<stormgmt::Error> for SimulationError {
    fn from(err: stormgmt::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}
