//! Unary gRPC client for the management service.

use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use crate::messages::*;

/// Fully qualified service name used in request paths.
pub const SERVICE_NAME: &str = "stormgmt.v2.Management";

/// Client for the management service.
///
/// Cloning is cheap: the underlying [`Channel`] is reference counted, so a
/// clone per call is the expected usage pattern.
#[derive(Debug, Clone)]
pub struct ManagementClient {
    inner: tonic::client::Grpc<Channel>,
}

macro_rules! unary_method {
    ($(#[$meta:meta])* $fn_name:ident, $method:literal, $req:ty, $resp:ty) => {
        $(#[$meta])*
        pub async fn $fn_name(
            &mut self,
            request: Request<$req>,
        ) -> Result<Response<$resp>, Status> {
            self.unary(request, concat!("/stormgmt.v2.Management/", $method))
                .await
        }
    };
}

impl ManagementClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    async fn unary<Req, Resp>(
        &mut self,
        request: Request<Req>,
        path: &'static str,
    ) -> Result<Response<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        self.inner
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
    }

    unary_method!(
        /// Report the API version spoken by the server.
        get_version,
        "GetVersion",
        GetVersionRequest,
        GetVersionResponse
    );
    unary_method!(get_cluster_info, "GetClusterInfo", GetClusterInfoRequest, ClusterInfo);
    unary_method!(list_nodes, "ListNodes", ListNodesRequest, ListNodesResponse);
    unary_method!(get_volume, "GetVolume", GetVolumeRequest, Volume);
    unary_method!(create_volume, "CreateVolume", CreateVolumeRequest, Volume);
    unary_method!(
        /// Apply a sparse update. The caller attaches the `if-match` header.
        update_volume,
        "UpdateVolume",
        UpdateVolumeRequest,
        UpdateVolumeResponse
    );
    unary_method!(delete_volume, "DeleteVolume", DeleteVolumeRequest, DeleteVolumeResponse);
    unary_method!(get_snapshot, "GetSnapshot", GetSnapshotRequest, Snapshot);
    unary_method!(create_snapshot, "CreateSnapshot", CreateSnapshotRequest, Snapshot);
    unary_method!(
        delete_snapshot,
        "DeleteSnapshot",
        DeleteSnapshotRequest,
        DeleteSnapshotResponse
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_matches_request_paths() {
        let path = concat!("/stormgmt.v2.Management/", "GetVolume");
        assert!(path.starts_with(&format!("/{SERVICE_NAME}/")));
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let channel = tonic::transport::Endpoint::from_static("http://127.0.0.1:1")
            .connect_timeout(std::time::Duration::from_millis(200))
            .connect_lazy();
        let mut client = ManagementClient::new(channel);
        let err = client
            .get_version(Request::new(GetVersionRequest {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }
}
