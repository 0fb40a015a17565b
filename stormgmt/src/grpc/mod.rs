//! gRPC-backed implementation of [`ManagementApi`](crate::api::ManagementApi).

mod convert;
mod resolver;
mod transport;

pub use resolver::{PeerChange, PeerTracker, Resolver};
pub use transport::GrpcTransport;
