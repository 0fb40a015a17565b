//! Pooled management client.

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::ManagementApi;
use crate::config::{Config, RetryPolicy};
use crate::context::CallContext;
use crate::endpoint::EndpointSet;
use crate::error::{Error, Result};
use crate::grpc::GrpcTransport;
use crate::pool::{DialFn, PooledClient};
use crate::types::{
    ClusterInfo, Lookup, MgmtScheme, Node, SUPPORTED_API_VERSIONS, Snapshot, Volume,
};

const CLIENT_ID_LEN: usize = 7;

/// Fresh client ID: a random `u32` in base 36, zero-padded to 7 characters.
pub fn new_client_id() -> String {
    let mut n: u32 = rand::random();
    let mut digits = Vec::with_capacity(CLIENT_ID_LEN);
    while n > 0 {
        let d = (n % 36) as u8;
        digits.push(if d < 10 { b'0' + d } else { b'a' + d - 10 });
        n /= 36;
    }
    while digits.len() < CLIENT_ID_LEN {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Management client for one cluster, shared through a
/// [`ClientPool`](crate::ClientPool).
///
/// Plain reads live here; the idempotent create/update/delete protocol is in
/// the `lifecycle` module.
pub struct Client {
    id: String,
    targets: EndpointSet,
    pub(crate) api: Arc<dyn ManagementApi>,
    pub(crate) retry: RetryPolicy,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("targets", &self.targets)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(id: impl Into<String>, targets: EndpointSet, api: Arc<dyn ManagementApi>) -> Self {
        Self::with_retry(id, targets, api, RetryPolicy::default())
    }

    pub fn with_retry(
        id: impl Into<String>,
        targets: EndpointSet,
        api: Arc<dyn ManagementApi>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            targets,
            api,
            retry,
        }
    }

    /// Connect to one of `targets` over gRPC.
    pub async fn dial(
        ctx: &CallContext,
        targets: EndpointSet,
        scheme: MgmtScheme,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let id = new_client_id();
        debug!(client_id = %id, targets = %targets, scheme = %scheme, "dialing");
        let transport =
            GrpcTransport::dial(ctx, &id, &targets, scheme, config.client.call_timeout()).await?;
        info!(client_id = %id, targets = %targets, scheme = %scheme, "connected to management API");
        Ok(Arc::new(Self::with_retry(
            id,
            targets,
            Arc::new(transport),
            config.retry.policy(),
        )))
    }

    /// Dial function for a [`ClientPool`](crate::ClientPool) of gRPC clients.
    pub fn dialer(config: &Config) -> DialFn<Client> {
        let config = Arc::new(config.clone());
        Arc::new(move |ctx: CallContext, targets: EndpointSet, scheme: MgmtScheme| {
            let config = config.clone();
            async move { Client::dial(&ctx, targets, scheme, &config).await }.boxed()
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn targets(&self) -> &EndpointSet {
        &self.targets
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Check that the server is reachable and speaks a supported API version.
    pub async fn remote_ok(&self, ctx: &CallContext) -> Result<()> {
        let version = self.api.get_version(ctx).await?;
        if !SUPPORTED_API_VERSIONS.contains(&version.as_str()) {
            return Err(Error::Unimplemented(format!(
                "unsupported management API version '{version}', need one of {SUPPORTED_API_VERSIONS:?}"
            )));
        }
        Ok(())
    }

    pub async fn get_cluster_info(&self, ctx: &CallContext) -> Result<ClusterInfo> {
        self.api.get_cluster_info(ctx).await
    }

    /// Cluster nodes, sorted by name.
    pub async fn list_nodes(&self, ctx: &CallContext) -> Result<Vec<Node>> {
        let mut nodes = self.api.list_nodes(ctx).await?;
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    pub async fn get_volume(&self, ctx: &CallContext, uuid: Uuid, project: &str) -> Result<Volume> {
        self.api.get_volume(ctx, Lookup::Uuid(uuid), project).await
    }

    pub async fn get_volume_by_name(
        &self,
        ctx: &CallContext,
        name: &str,
        project: &str,
    ) -> Result<Volume> {
        self.api.get_volume(ctx, Lookup::Name(name), project).await
    }

    pub async fn get_snapshot(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        project: &str,
    ) -> Result<Snapshot> {
        self.api.get_snapshot(ctx, Lookup::Uuid(uuid), project).await
    }

    pub async fn get_snapshot_by_name(
        &self,
        ctx: &CallContext,
        name: &str,
        project: &str,
    ) -> Result<Snapshot> {
        self.api.get_snapshot(ctx, Lookup::Name(name), project).await
    }
}

impl PooledClient for Client {
    fn id(&self) -> &str {
        &self.id
    }

    fn targets(&self) -> &EndpointSet {
        &self.targets
    }

    fn close(&self) {
        info!(client_id = %self.id, targets = %self.targets, "closing client");
        self.api.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_seven_base36_chars() {
        for _ in 0..1000 {
            let id = new_client_id();
            assert_eq!(id.len(), CLIENT_ID_LEN, "{id}");
            assert!(
                id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()),
                "{id}"
            );
            assert!(u32::from_str_radix(&id, 36).is_ok(), "{id}");
        }
    }

    #[test]
    fn client_ids_differ() {
        assert_ne!(new_client_id(), new_client_id());
    }

    #[tokio::test]
    async fn debug_names_client_and_targets() {
        let targets = EndpointSet::parse(&["10.0.0.1:443"]).unwrap();
        let call_timeout = Config::default().client.call_timeout();
        let transport =
            GrpcTransport::lazy("abc1234", &targets, MgmtScheme::Grpc, call_timeout).unwrap();
        let client = Client::new("abc1234", targets, Arc::new(transport));
        let out = format!("{client:?}");
        assert!(out.starts_with("Client {"), "{out}");
        assert!(out.contains("abc1234"), "{out}");
        assert!(out.contains("10.0.0.1"), "{out}");
    }

    #[tokio::test]
    async fn dialer_reports_unreachable_cluster() {
        let dial = Client::dialer(&Config::default());
        let ctx = CallContext::background().with_timeout(std::time::Duration::from_millis(200));
        let targets = EndpointSet::parse(&["127.0.0.1:1"]).unwrap();
        let res = dial(ctx, targets, MgmtScheme::Grpc).await;
        assert!(matches!(res, Err(Error::DeadlineExceeded(_))));
    }
}
