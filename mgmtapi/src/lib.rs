//! Management API wire protocol for the storage cluster.
//!
//! This crate holds the protobuf messages exchanged with the cluster's
//! management service and a thin unary gRPC client over a tonic
//! [`Channel`](tonic::transport::Channel). Messages are declared by hand with
//! `prost` derives so no protoc toolchain is needed at build time.
//!
//! The crate carries no retry, validation or lifecycle logic; those live in
//! `stormgmt`.

mod client;
mod messages;

pub use client::{ManagementClient, SERVICE_NAME};
pub use messages::*;

/// Metadata key carrying the optimistic-concurrency version token.
pub const IF_MATCH_HEADER: &str = "if-match";

/// Metadata key carrying bearer credentials.
pub const AUTHORIZATION_HEADER: &str = "authorization";
