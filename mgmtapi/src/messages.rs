//! Protobuf messages of the management service.

/// Wrapper so that an absent ACL can be told apart from an empty one.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringList {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum VolumeState {
    Unknown = 0,
    Creating = 1,
    Available = 2,
    Deleting = 3,
    Deleted = 4,
    Failed = 7,
    Updating = 8,
    Rollback = 9,
    Migrating = 10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtectionState {
    Unknown = 0,
    FullyProtected = 1,
    Degraded = 2,
    ReadOnly = 3,
    NotAvailable = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SnapshotState {
    Unknown = 0,
    Creating = 1,
    Available = 2,
    Deleting = 3,
    Deleted = 4,
    Failed = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum NodeState {
    Unknown = 0,
    Active = 1,
    Activating = 2,
    Inactive = 3,
    Unattached = 4,
    Attaching = 6,
    Detaching = 7,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Volume {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(enumeration = "VolumeState", tag = "3")]
    pub state: i32,
    #[prost(enumeration = "ProtectionState", tag = "4")]
    pub protection_state: i32,
    #[prost(uint32, tag = "5")]
    pub replica_count: u32,
    #[prost(message, optional, tag = "6")]
    pub acl: Option<StringList>,
    #[prost(uint64, tag = "7")]
    pub size: u64,
    /// "true" or "false".
    #[prost(string, tag = "8")]
    pub compression: String,
    #[prost(string, tag = "9")]
    pub e_tag: String,
    #[prost(string, tag = "10")]
    pub project_name: String,
    #[prost(string, tag = "11")]
    pub source_snapshot_uuid: String,
}

/// Exactly one of `uuid` and `name` is set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetVolumeRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub project_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateVolumeRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Capacity in bytes, rendered as a decimal string.
    #[prost(string, tag = "2")]
    pub size: String,
    #[prost(message, optional, tag = "3")]
    pub acl: Option<StringList>,
    #[prost(string, tag = "4")]
    pub compression: String,
    #[prost(uint32, tag = "5")]
    pub replica_count: u32,
    #[prost(string, tag = "6")]
    pub project_name: String,
    #[prost(string, tag = "7")]
    pub source_snapshot_uuid: String,
}

/// Sparse update: unset fields are left unchanged by the server.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateVolumeRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub project_name: String,
    #[prost(message, optional, tag = "3")]
    pub acl: Option<StringList>,
    #[prost(string, tag = "4")]
    pub size: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateVolumeResponse {
    #[prost(message, optional, tag = "1")]
    pub updated: Option<Volume>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteVolumeRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub project_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteVolumeResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Snapshot {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    #[prost(enumeration = "SnapshotState", tag = "4")]
    pub state: i32,
    #[prost(string, tag = "5")]
    pub source_volume_uuid: String,
    #[prost(string, tag = "6")]
    pub source_volume_name: String,
    #[prost(uint32, tag = "7")]
    pub replica_count: u32,
    #[prost(bool, tag = "8")]
    pub compression: bool,
    #[prost(message, optional, tag = "9")]
    pub creation_time: Option<::prost_types::Timestamp>,
    #[prost(string, tag = "10")]
    pub e_tag: String,
    #[prost(string, tag = "11")]
    pub project_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSnapshotRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub project_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateSnapshotRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub source_volume_uuid: String,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(string, tag = "4")]
    pub project_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteSnapshotRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub project_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteSnapshotResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetVersionRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetVersionResponse {
    #[prost(string, tag = "1")]
    pub api_version: String,
    #[prost(string, tag = "2")]
    pub server_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetClusterInfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterInfo {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub subsystem_nqn: String,
    #[prost(uint32, tag = "3")]
    pub current_max_replicas: u32,
    #[prost(uint32, tag = "4")]
    pub supported_max_replicas: u32,
    #[prost(string, repeated, tag = "5")]
    pub discovery_endpoints: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    pub api_endpoints: Vec<String>,
    #[prost(string, repeated, tag = "7")]
    pub nvme_endpoints: Vec<String>,
    /// Free capacity in bytes.
    #[prost(uint64, tag = "8")]
    pub free_capacity: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListNodesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListNodesResponse {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(string, tag = "3")]
    pub hostname: String,
    #[prost(string, tag = "4")]
    pub nvme_endpoint: String,
    #[prost(enumeration = "NodeState", tag = "5")]
    pub state: i32,
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn absent_acl_differs_from_empty_acl() {
        let absent = UpdateVolumeRequest {
            uuid: "u".to_string(),
            ..Default::default()
        };
        let empty = UpdateVolumeRequest {
            uuid: "u".to_string(),
            acl: Some(StringList::default()),
            ..Default::default()
        };
        let absent = UpdateVolumeRequest::decode(absent.encode_to_vec().as_slice()).unwrap();
        let empty = UpdateVolumeRequest::decode(empty.encode_to_vec().as_slice()).unwrap();
        assert!(absent.acl.is_none());
        assert_eq!(empty.acl, Some(StringList::default()));
    }

    #[test]
    fn unknown_state_values_are_rejected() {
        assert_eq!(VolumeState::try_from(8), Ok(VolumeState::Updating));
        assert!(VolumeState::try_from(5).is_err());
        assert!(SnapshotState::try_from(42).is_err());
    }
}
