//! Deterministic Simulation Testing (DST) for stormgmt.
//!
//! This crate keeps the in-memory cluster and the scripted dialer out of the
//! main stormgmt crate, so fakes are never compiled into production binaries.
//!
//! ## Crate Structure
//!
//! - `fake` - In-memory management API and dialer with fault injection
//! - `harness` - Simulation harnesses and oracles for correctness verification
//! - `simulation` - Runtime and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p stormgmt-dst simulation
//!
//! # Nightly long-running tests
//! cargo test -p stormgmt-dst simulation -- --ignored
//! ```

pub mod fake;
pub mod harness;
pub mod simulation;

pub use fake::{BLOCK_FOREVER_PORT, FAIL_PROMPTLY_PORT, FakeCluster, FakeDialer, Op};
pub use harness::volume::fast_retry_policy;
pub use harness::{
    PoolAction, PoolHarness, PoolOracle, PoolSimStats, SimulationError, VolumeHarness,
    VolumeSimStats,
};
pub use simulation::{build_runtime, get_seed, run_pool_simulation, run_volume_simulation};
