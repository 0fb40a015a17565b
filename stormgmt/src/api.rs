//! The remote management API as seen by the lifecycle protocol.

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::CallContext;
use crate::error::Result;
use crate::types::{ClusterInfo, Lookup, Node, Snapshot, Volume, VolumeSpec, VolumeUpdate};

/// One logical connection to a cluster's management service.
///
/// Implementations translate each call to the wire and classify failures
/// into [`Error`](crate::Error) categories; they do not retry across
/// resource state transitions. Returned records are validated snapshots of
/// the server's view.
#[async_trait]
pub trait ManagementApi: Send + Sync + 'static {
    /// API version reported by the server, e.g. `v2.0`.
    async fn get_version(&self, ctx: &CallContext) -> Result<String>;

    async fn get_cluster_info(&self, ctx: &CallContext) -> Result<ClusterInfo>;

    async fn list_nodes(&self, ctx: &CallContext) -> Result<Vec<Node>>;

    async fn get_volume(
        &self,
        ctx: &CallContext,
        lookup: Lookup<'_>,
        project: &str,
    ) -> Result<Volume>;

    /// Issue a create. `spec.acl` is sent exactly as given.
    async fn create_volume(&self, ctx: &CallContext, spec: &VolumeSpec) -> Result<Volume>;

    /// Apply `update` only if the volume's current version is `etag`.
    async fn update_volume(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        project: &str,
        update: &VolumeUpdate,
        etag: &str,
    ) -> Result<()>;

    async fn delete_volume(&self, ctx: &CallContext, uuid: Uuid, project: &str) -> Result<()>;

    async fn get_snapshot(
        &self,
        ctx: &CallContext,
        lookup: Lookup<'_>,
        project: &str,
    ) -> Result<Snapshot>;

    async fn create_snapshot(
        &self,
        ctx: &CallContext,
        name: &str,
        project: &str,
        src_vol_uuid: Uuid,
    ) -> Result<Snapshot>;

    async fn delete_snapshot(&self, ctx: &CallContext, uuid: Uuid, project: &str) -> Result<()>;

    /// Tear down the underlying transport.
    fn close(&self);
}
