//! Multi-endpoint gRPC transport for the management API.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use mgmtapi::{self as wire, AUTHORIZATION_HEADER, IF_MATCH_HEADER, ManagementClient};
use parking_lot::Mutex;
use rand::Rng;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{ClientTlsConfig, Endpoint as TonicEndpoint};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::convert;
use super::resolver::{PeerChange, PeerTracker, Resolver};
use crate::api::ManagementApi;
use crate::context::CallContext;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{Error, Result};
use crate::types::{
    ClusterInfo, Lookup, MgmtScheme, Node, Snapshot, Volume, VolumeSpec, VolumeUpdate,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

const DIAL_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DIAL_BACKOFF_FACTOR: f64 = 1.6;
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(7);

#[derive(Clone)]
struct Connection {
    endpoint: Endpoint,
    client: ManagementClient,
}

/// One logical connection spanning every endpoint of a cluster.
///
/// Calls go to the endpoint at the head of the [`Resolver`]. A call failing
/// with `Unavailable` rotates the ordering and swaps in a lazily connected
/// channel to the new head. Idempotent reads are retried over one full pass
/// of the endpoints; writes are not retried since the server may have
/// applied them.
///
/// [`close`](ManagementApi::close) drops the channel; later calls fail with
/// `Canceled`.
pub struct GrpcTransport {
    id: String,
    scheme: MgmtScheme,
    resolver: Resolver,
    conn: Mutex<Option<Connection>>,
    peers: Mutex<PeerTracker>,
    call_timeout: Duration,
}

impl GrpcTransport {
    /// Connect to the first reachable endpoint of `targets`.
    ///
    /// Endpoints are tried in order with a jittered backoff between passes;
    /// only `ctx` bounds how long this keeps trying.
    pub async fn dial(
        ctx: &CallContext,
        id: &str,
        targets: &EndpointSet,
        scheme: MgmtScheme,
        call_timeout: Duration,
    ) -> Result<Self> {
        let resolver = Resolver::new(id, targets)?;
        let conn = ctx.run(connect_any(id, &resolver, scheme)).await?;
        Ok(Self::with_connection(id, scheme, resolver, conn, call_timeout))
    }

    /// Build a transport without connecting; the first call dials.
    pub fn lazy(
        id: &str,
        targets: &EndpointSet,
        scheme: MgmtScheme,
        call_timeout: Duration,
    ) -> Result<Self> {
        let resolver = Resolver::new(id, targets)?;
        let head = resolver.head();
        let client = ManagementClient::new(endpoint_for(&head, scheme)?.connect_lazy());
        let conn = Connection {
            endpoint: head,
            client,
        };
        Ok(Self::with_connection(id, scheme, resolver, conn, call_timeout))
    }

    fn with_connection(
        id: &str,
        scheme: MgmtScheme,
        resolver: Resolver,
        conn: Connection,
        call_timeout: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            scheme,
            resolver,
            conn: Mutex::new(Some(conn)),
            peers: Mutex::new(PeerTracker::default()),
            call_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Endpoint currently receiving calls, `None` once closed.
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.conn.lock().as_ref().map(|c| c.endpoint.clone())
    }

    /// Number of times a call was served by a different endpoint than the
    /// previous call.
    pub fn peer_switches(&self) -> u64 {
        self.peers.lock().switches()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Move off `failed`, unless a concurrent call already did.
    fn rotate_from(&self, failed: &Endpoint) {
        let mut guard = self.conn.lock();
        let Some(conn) = guard.as_mut() else {
            return;
        };
        if conn.endpoint != *failed {
            return;
        }
        let next = self.resolver.resolve_now();
        if next == *failed {
            return;
        }
        match endpoint_for(&next, self.scheme) {
            Ok(endpoint) => {
                *conn = Connection {
                    client: ManagementClient::new(endpoint.connect_lazy()),
                    endpoint: next,
                };
            }
            Err(e) => {
                warn!(client_id = %self.id, endpoint = %next, error = %e, "cannot build channel");
            }
        }
    }

    fn observe_peer(&self, peer: &Endpoint, method: &'static str) {
        let change = self.peers.lock().observe(peer);
        match change {
            PeerChange::First => {
                info!(client_id = %self.id, peer = %peer, method, "using management endpoint");
            }
            PeerChange::Switched { from } => {
                warn!(
                    client_id = %self.id,
                    peer = %peer,
                    from = %from,
                    method,
                    "management endpoint switched"
                );
            }
            PeerChange::Same => {}
        }
    }

    async fn unary<Req, Resp, F, Fut>(
        &self,
        ctx: &CallContext,
        method: &'static str,
        idempotent: bool,
        etag: Option<&str>,
        req: Req,
        call: F,
    ) -> Result<Resp>
    where
        Req: Clone,
        F: Fn(ManagementClient, Request<Req>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<Resp>, Status>>,
    {
        let attempts = if idempotent { self.resolver.len() } else { 1 };
        let mut attempt = 0;
        loop {
            ctx.check()?;
            let Some(Connection { endpoint, client }) = self.conn.lock().clone() else {
                return Err(Error::Canceled(format!("client {} is closed", self.id)));
            };
            let timeout = ctx.call_timeout(self.call_timeout);
            let mut request = Request::new(req.clone());
            request.set_timeout(timeout);
            attach_metadata(&mut request, ctx, etag)?;

            let call_ctx = ctx.with_timeout(timeout);
            let res = call_ctx
                .run(async { call(client, request).await.map_err(Error::from) })
                .await;
            attempt += 1;
            match res {
                Ok(resp) => {
                    self.observe_peer(&endpoint, method);
                    return Ok(resp.into_inner());
                }
                Err(Error::Unavailable(msg)) => {
                    debug!(
                        client_id = %self.id,
                        endpoint = %endpoint,
                        method,
                        error = %msg,
                        "endpoint unavailable"
                    );
                    self.rotate_from(&endpoint);
                    if attempt >= attempts || ctx.err().is_some() {
                        return Err(Error::Unavailable(msg));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn attach_metadata<T>(request: &mut Request<T>, ctx: &CallContext, etag: Option<&str>) -> Result<()> {
    if let Some(jwt) = ctx.credentials() {
        let value: MetadataValue<Ascii> = format!("Bearer {jwt}")
            .parse()
            .map_err(|_| Error::InvalidArgument("credentials are not valid metadata".to_string()))?;
        request.metadata_mut().insert(AUTHORIZATION_HEADER, value);
    }
    if let Some(etag) = etag {
        let value: MetadataValue<Ascii> = etag
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid etag '{etag}'")))?;
        request.metadata_mut().insert(IF_MATCH_HEADER, value);
    }
    Ok(())
}

fn endpoint_for(ep: &Endpoint, scheme: MgmtScheme) -> Result<TonicEndpoint> {
    let proto = match scheme {
        MgmtScheme::Grpc => "http",
        MgmtScheme::Grpcs => "https",
    };
    let invalid = |reason: String| Error::InvalidEndpoint {
        endpoint: ep.to_string(),
        reason,
    };
    let mut endpoint = TonicEndpoint::from_shared(format!("{proto}://{ep}"))
        .map_err(|e| invalid(e.to_string()))?
        .connect_timeout(CONNECT_TIMEOUT)
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true)
        .user_agent(concat!("stormgmt/", env!("CARGO_PKG_VERSION")))
        .map_err(|e| invalid(e.to_string()))?;
    if scheme == MgmtScheme::Grpcs {
        // server name without the URI's IPv6 brackets
        let tls = ClientTlsConfig::new()
            .with_webpki_roots()
            .domain_name(ep.host());
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| invalid(e.to_string()))?;
    }
    Ok(endpoint)
}

/// Delay before the `pass`-th walk over the endpoints.
fn dial_delay(pass: u32) -> Duration {
    let base = DIAL_BACKOFF_BASE.as_secs_f64() * DIAL_BACKOFF_FACTOR.powi(pass as i32);
    let capped = base.min(DIAL_BACKOFF_MAX.as_secs_f64());
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_secs_f64(capped * jitter)
}

async fn connect_any(id: &str, resolver: &Resolver, scheme: MgmtScheme) -> Result<Connection> {
    let mut pass = 0;
    loop {
        let mut last_build_err = None;
        let mut built = 0;
        for _ in 0..resolver.len() {
            let head = resolver.head();
            let endpoint = match endpoint_for(&head, scheme) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(client_id = %id, endpoint = %head, error = %e, "cannot build channel");
                    resolver.resolve_now();
                    last_build_err = Some(e);
                    continue;
                }
            };
            built += 1;
            match endpoint.connect().await {
                Ok(channel) => {
                    debug!(client_id = %id, endpoint = %head, "connected");
                    return Ok(Connection {
                        endpoint: head,
                        client: ManagementClient::new(channel),
                    });
                }
                Err(e) => {
                    warn!(client_id = %id, endpoint = %head, error = %e, "connect failed");
                    resolver.resolve_now();
                }
            }
        }
        // no endpoint can ever be dialed
        if let (0, Some(e)) = (built, last_build_err) {
            return Err(e);
        }
        tokio::time::sleep(dial_delay(pass)).await;
        pass += 1;
    }
}

#[async_trait]
impl ManagementApi for GrpcTransport {
    async fn get_version(&self, ctx: &CallContext) -> Result<String> {
        let resp = self
            .unary(ctx, "GetVersion", true, None, wire::GetVersionRequest {}, |mut c, r| async move {
                c.get_version(r).await
            })
            .await?;
        Ok(resp.api_version)
    }

    async fn get_cluster_info(&self, ctx: &CallContext) -> Result<ClusterInfo> {
        let resp = self
            .unary(
                ctx,
                "GetClusterInfo",
                true,
                None,
                wire::GetClusterInfoRequest {},
                |mut c, r| async move { c.get_cluster_info(r).await },
            )
            .await?;
        convert::cluster_info_from_wire(resp)
    }

    async fn list_nodes(&self, ctx: &CallContext) -> Result<Vec<Node>> {
        let resp = self
            .unary(ctx, "ListNodes", true, None, wire::ListNodesRequest {}, |mut c, r| async move {
                c.list_nodes(r).await
            })
            .await?;
        convert::nodes_from_wire(resp.nodes)
    }

    async fn get_volume(
        &self,
        ctx: &CallContext,
        lookup: Lookup<'_>,
        project: &str,
    ) -> Result<Volume> {
        let (uuid, name) = convert::lookup_fields(lookup);
        let req = wire::GetVolumeRequest {
            uuid,
            name,
            project_name: project.to_string(),
        };
        let resp = self
            .unary(ctx, "GetVolume", true, None, req, |mut c, r| async move {
                c.get_volume(r).await
            })
            .await?;
        convert::volume_from_wire(resp, Some(lookup))
    }

    async fn create_volume(&self, ctx: &CallContext, spec: &VolumeSpec) -> Result<Volume> {
        let req = convert::create_volume_request(spec);
        let resp = self
            .unary(ctx, "CreateVolume", false, None, req, |mut c, r| async move {
                c.create_volume(r).await
            })
            .await?;
        convert::volume_from_wire(resp, Some(Lookup::Name(&spec.name)))
    }

    async fn update_volume(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        project: &str,
        update: &VolumeUpdate,
        etag: &str,
    ) -> Result<()> {
        let req = convert::update_volume_request(uuid, project, update);
        self.unary(ctx, "UpdateVolume", false, Some(etag), req, |mut c, r| async move {
            c.update_volume(r).await
        })
        .await?;
        Ok(())
    }

    async fn delete_volume(&self, ctx: &CallContext, uuid: Uuid, project: &str) -> Result<()> {
        let req = wire::DeleteVolumeRequest {
            uuid: uuid.to_string(),
            project_name: project.to_string(),
        };
        self.unary(ctx, "DeleteVolume", false, None, req, |mut c, r| async move {
            c.delete_volume(r).await
        })
        .await?;
        Ok(())
    }

    async fn get_snapshot(
        &self,
        ctx: &CallContext,
        lookup: Lookup<'_>,
        project: &str,
    ) -> Result<Snapshot> {
        let (uuid, name) = convert::lookup_fields(lookup);
        let req = wire::GetSnapshotRequest {
            uuid,
            name,
            project_name: project.to_string(),
        };
        let resp = self
            .unary(ctx, "GetSnapshot", true, None, req, |mut c, r| async move {
                c.get_snapshot(r).await
            })
            .await?;
        convert::snapshot_from_wire(resp, Some(lookup))
    }

    async fn create_snapshot(
        &self,
        ctx: &CallContext,
        name: &str,
        project: &str,
        src_vol_uuid: Uuid,
    ) -> Result<Snapshot> {
        let req = wire::CreateSnapshotRequest {
            name: name.to_string(),
            source_volume_uuid: src_vol_uuid.to_string(),
            description: String::new(),
            project_name: project.to_string(),
        };
        let resp = self
            .unary(ctx, "CreateSnapshot", false, None, req, |mut c, r| async move {
                c.create_snapshot(r).await
            })
            .await?;
        convert::snapshot_from_wire(resp, Some(Lookup::Name(name)))
    }

    async fn delete_snapshot(&self, ctx: &CallContext, uuid: Uuid, project: &str) -> Result<()> {
        let req = wire::DeleteSnapshotRequest {
            uuid: uuid.to_string(),
            project_name: project.to_string(),
        };
        self.unary(ctx, "DeleteSnapshot", false, None, req, |mut c, r| async move {
            c.delete_snapshot(r).await
        })
        .await?;
        Ok(())
    }

    fn close(&self) {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            debug!(client_id = %self.id, endpoint = %conn.endpoint, "transport closed");
        }
    }
}
