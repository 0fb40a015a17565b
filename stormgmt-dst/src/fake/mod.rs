//! Fakes standing in for a real cluster and for network dials.

pub mod cluster;
pub mod dialer;

pub use cluster::{FakeCluster, Op};
pub use dialer::{BLOCK_FOREVER_PORT, FAIL_PROMPTLY_PORT, FakeDialer};
