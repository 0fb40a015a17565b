//! stormgmt: pooled control-plane client for a storage cluster's management API.
//!
//! One [`ClientPool`] per process keeps at most one live connection per
//! cluster, identified by its [`EndpointSet`]. Each pooled [`Client`] spans
//! every endpoint of its cluster and moves to the next one when the current
//! endpoint stops answering. On top of that, volumes and snapshots are
//! created, updated and deleted idempotently: every wait is bounded by a
//! [`CallContext`] and updates use the server's ETag for optimistic
//! concurrency.
//!
//! # Library Usage
//!
//! ```ignore
//! use stormgmt::{CallContext, Client, ClientPool, Config, EndpointSet, MgmtScheme};
//!
//! let config = Config::default();
//! let pool = ClientPool::new((&config.pool).into(), Client::dialer(&config));
//! let ctx = CallContext::background().with_timeout(Duration::from_secs(30));
//! let targets = EndpointSet::parse_csv("10.0.0.1:443,10.0.0.2:443")?;
//!
//! let client = pool.lease(&ctx, &targets, MgmtScheme::Grpcs).await?;
//! let vol = client.get_volume_by_name(&ctx, "pvc-1", "default").await?;
//! ```

pub mod api;
pub mod backoff;
pub mod client;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod grpc;
mod lifecycle;
pub mod pool;
pub mod types;

#[cfg(test)]
mod test_util;

pub use api::ManagementApi;
pub use backoff::{Backoff, with_exponential_backoff, with_retries};
pub use client::{Client, new_client_id};
pub use config::{Config, PoolConfig, RetryPolicy};
pub use context::CallContext;
pub use endpoint::{Endpoint, EndpointSet};
pub use error::{ConfigError, Error, Result};
pub use pool::{ClientPool, DialFn, Lease, PoolOptions, PoolStats, PooledClient};
pub use types::{
    ACL_ALLOW_ANY, ACL_ALLOW_NONE, ClusterInfo, Lookup, MgmtScheme, Node, NodeState, Snapshot,
    SnapshotState, Volume, VolumeProtection, VolumeSpec, VolumeState, VolumeUpdate,
};
