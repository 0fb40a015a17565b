//! Domain types of the management API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// ACL entry granting access to any host.
pub const ACL_ALLOW_ANY: &str = "ALLOW_ANY";
/// ACL entry denying access to all hosts.
pub const ACL_ALLOW_NONE: &str = "ALLOW_NONE";

/// Upper bound on a volume's replica count accepted from the server.
pub const MAX_REPLICA_COUNT: u32 = 128;

/// API versions this client speaks.
pub const SUPPORTED_API_VERSIONS: &[&str] = &["v2.0"];

/// Sorted, deduplicated copy of an ACL.
pub fn normalize_acl<S: AsRef<str>>(acl: &[S]) -> Vec<String> {
    let mut out: Vec<String> = acl.iter().map(|s| s.as_ref().to_string()).collect();
    out.sort();
    out.dedup();
    out
}

/// Transport security towards the management endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MgmtScheme {
    #[default]
    Grpc,
    Grpcs,
}

impl MgmtScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            MgmtScheme::Grpc => "grpc",
            MgmtScheme::Grpcs => "grpcs",
        }
    }
}

impl fmt::Display for MgmtScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MgmtScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "grpc" => Ok(MgmtScheme::Grpc),
            "grpcs" => Ok(MgmtScheme::Grpcs),
            other => Err(Error::InvalidArgument(format!(
                "unsupported management scheme '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    #[default]
    Unknown,
    Creating,
    Available,
    Deleting,
    Failed,
    Updating,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeState::Unknown => "unknown",
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::Deleting => "deleting",
            VolumeState::Failed => "failed",
            VolumeState::Updating => "updating",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeProtection {
    #[default]
    Unknown,
    Protected,
    Degraded,
    ReadOnly,
    NotAvailable,
}

impl fmt::Display for VolumeProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeProtection::Unknown => "unknown",
            VolumeProtection::Protected => "fully-protected",
            VolumeProtection::Degraded => "degraded",
            VolumeProtection::ReadOnly => "read-only",
            VolumeProtection::NotAvailable => "not-available",
        };
        f.write_str(s)
    }
}

/// A volume as last observed on the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub uuid: Uuid,
    pub replica_count: u32,
    /// Bytes.
    pub capacity: u64,
    pub compression: bool,
    /// Source snapshot, if the volume was cloned from one.
    pub snapshot_uuid: Option<Uuid>,
    pub acl: Vec<String>,
    pub state: VolumeState,
    pub protection: VolumeProtection,
    /// Opaque version token for optimistic concurrency.
    pub etag: String,
    pub project_name: String,
}

/// Core fields to leave out of [`Volume::explain_diffs_from`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffSkip {
    pub uuid: bool,
    pub capacity: bool,
}

impl Volume {
    pub fn is_accessible(&self) -> bool {
        matches!(self.state, VolumeState::Available | VolumeState::Updating)
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.protection,
            VolumeProtection::Protected | VolumeProtection::Degraded
        )
    }

    pub fn is_usable(&self) -> bool {
        self.is_accessible() && self.is_writable()
    }

    /// Human-readable sentences, one per differing core field.
    ///
    /// `left` and `right` name `self` and `other` in the output, e.g.
    /// "requested" and "actual".
    pub fn explain_diffs_from(
        &self,
        other: &Volume,
        left: &str,
        right: &str,
        skip: DiffSkip,
    ) -> Vec<String> {
        let mut diffs = Vec::new();
        let mut diff = |field: &str, l: &dyn fmt::Display, r: &dyn fmt::Display| {
            diffs.push(format!("{left} {field} '{l}' != {right} {field} '{r}'"));
        };
        if self.name != other.name {
            diff("name", &self.name, &other.name);
        }
        if !skip.uuid && self.uuid != other.uuid {
            diff("UUID", &self.uuid, &other.uuid);
        }
        if self.replica_count != other.replica_count {
            diff("replica count", &self.replica_count, &other.replica_count);
        }
        if !skip.capacity && self.capacity != other.capacity {
            diff("capacity", &self.capacity, &other.capacity);
        }
        if self.compression != other.compression {
            diff("compression", &self.compression, &other.compression);
        }
        if self.project_name != other.project_name {
            diff("project", &self.project_name, &other.project_name);
        }
        if self.snapshot_uuid != other.snapshot_uuid {
            diff(
                "source snapshot",
                &DisplayOpt(self.snapshot_uuid),
                &DisplayOpt(other.snapshot_uuid),
            );
        }
        diffs
    }

    /// Whether all core fields match.
    pub fn is_same_as(&self, other: &Volume) -> bool {
        self.explain_diffs_from(other, "", "", DiffSkip::default())
            .is_empty()
    }
}

struct DisplayOpt(Option<Uuid>);

impl fmt::Display for DisplayOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(u) => write!(f, "{u}"),
            None => f.write_str("<none>"),
        }
    }
}

/// Requested properties of a volume to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity: u64,
    pub replica_count: u32,
    pub compression: bool,
    pub acl: Vec<String>,
    pub project_name: String,
    pub snapshot_uuid: Option<Uuid>,
}

impl VolumeSpec {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("volume name is required".to_string()));
        }
        if self.capacity == 0 {
            return Err(Error::InvalidArgument(format!(
                "volume '{}' capacity must be > 0",
                self.name
            )));
        }
        if self.replica_count == 0 || self.replica_count > MAX_REPLICA_COUNT {
            return Err(Error::InvalidArgument(format!(
                "volume '{}' replica count {} out of range 1..={MAX_REPLICA_COUNT}",
                self.name, self.replica_count
            )));
        }
        Ok(())
    }

    /// ACL as it will be sent: normalized, `ALLOW_NONE` when empty.
    pub fn effective_acl(&self) -> Vec<String> {
        let acl = normalize_acl(&self.acl);
        if acl.is_empty() {
            vec![ACL_ALLOW_NONE.to_string()]
        } else {
            acl
        }
    }

    /// The requested properties viewed as a volume, for core comparisons.
    pub fn as_volume(&self) -> Volume {
        Volume {
            name: self.name.clone(),
            replica_count: self.replica_count,
            capacity: self.capacity,
            compression: self.compression,
            snapshot_uuid: self.snapshot_uuid,
            acl: self.effective_acl(),
            project_name: self.project_name.clone(),
            ..Default::default()
        }
    }
}

/// Sparse change to a volume; `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeUpdate {
    pub acl: Option<Vec<String>>,
    pub capacity: Option<u64>,
}

impl VolumeUpdate {
    pub fn is_empty(&self) -> bool {
        self.acl.is_none() && self.capacity.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotState {
    #[default]
    Unknown,
    Creating,
    Available,
    Deleting,
    Failed,
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Unknown => "unknown",
            SnapshotState::Creating => "creating",
            SnapshotState::Available => "available",
            SnapshotState::Deleting => "deleting",
            SnapshotState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub uuid: Uuid,
    /// Bytes.
    pub capacity: u64,
    pub src_vol_uuid: Uuid,
    pub src_vol_name: String,
    pub src_vol_replica_count: u32,
    pub src_vol_compression: bool,
    pub creation_time: DateTime<Utc>,
    pub state: SnapshotState,
    pub etag: String,
    pub project_name: String,
}

/// Selects a volume or snapshot by UUID or by name within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Uuid(Uuid),
    Name(&'a str),
}

impl fmt::Display for Lookup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Uuid(u) => write!(f, "{u}"),
            Lookup::Name(n) => write!(f, "'{n}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub uuid: Uuid,
    pub subsys_nqn: String,
    pub current_max_replicas: u32,
    pub max_replicas: u32,
    pub free_capacity: u64,
    pub discovery_endpoints: Vec<String>,
    pub api_endpoints: Vec<String>,
    pub nvme_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Active,
    Activating,
    Inactive,
    Unattached,
    Attaching,
    Detaching,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub uuid: Uuid,
    pub hostname: String,
    pub data_endpoint: String,
    pub state: NodeState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume() -> Volume {
        Volume {
            name: "pvc-1".to_string(),
            uuid: Uuid::new_v4(),
            replica_count: 3,
            capacity: 1 << 30,
            compression: false,
            state: VolumeState::Available,
            protection: VolumeProtection::Protected,
            ..Default::default()
        }
    }

    #[test]
    fn usability_needs_state_and_protection() {
        let mut vol = volume();
        assert!(vol.is_usable());
        vol.protection = VolumeProtection::ReadOnly;
        assert!(vol.is_accessible());
        assert!(!vol.is_usable());
        vol.protection = VolumeProtection::Degraded;
        vol.state = VolumeState::Creating;
        assert!(vol.is_writable());
        assert!(!vol.is_usable());
    }

    #[test]
    fn diffs_name_every_core_field() {
        let a = volume();
        let mut b = a.clone();
        b.replica_count = 2;
        b.capacity = 2 << 30;
        b.compression = true;
        b.acl = vec!["host-A".to_string()];
        b.etag = "7".to_string();
        let diffs = a.explain_diffs_from(&b, "requested", "actual", DiffSkip::default());
        assert_eq!(diffs.len(), 3);
        assert!(diffs[0].contains("requested replica count '3' != actual replica count '2'"));
        assert!(diffs.iter().any(|d| d.contains("capacity")));
        assert!(diffs.iter().any(|d| d.contains("compression")));
    }

    #[test]
    fn diffs_honor_skip() {
        let a = volume();
        let mut b = a.clone();
        b.uuid = Uuid::new_v4();
        b.capacity += 1;
        let skip = DiffSkip {
            uuid: true,
            capacity: true,
        };
        assert!(a.explain_diffs_from(&b, "l", "r", skip).is_empty());
        assert!(!a.is_same_as(&b));
    }

    #[test]
    fn spec_acl_defaults_to_allow_none() {
        let spec = VolumeSpec {
            name: "v".to_string(),
            capacity: 1,
            replica_count: 1,
            compression: false,
            acl: vec![],
            project_name: String::new(),
            snapshot_uuid: None,
        };
        assert_eq!(spec.effective_acl(), vec![ACL_ALLOW_NONE.to_string()]);
    }

    #[test]
    fn spec_validation() {
        let mut spec = VolumeSpec {
            name: "v".to_string(),
            capacity: 1,
            replica_count: 3,
            compression: false,
            acl: vec!["b".to_string(), "a".to_string(), "b".to_string()],
            project_name: String::new(),
            snapshot_uuid: None,
        };
        assert!(spec.validate().is_ok());
        assert_eq!(spec.effective_acl(), vec!["a", "b"]);
        spec.replica_count = MAX_REPLICA_COUNT + 1;
        assert!(matches!(spec.validate(), Err(Error::InvalidArgument(_))));
        spec.replica_count = 1;
        spec.name.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn scheme_parse() {
        assert_eq!("grpcs".parse::<MgmtScheme>().unwrap(), MgmtScheme::Grpcs);
        assert!("http".parse::<MgmtScheme>().is_err());
    }

    #[test]
    fn update_emptiness() {
        assert!(VolumeUpdate::default().is_empty());
        let update = VolumeUpdate {
            capacity: Some(5),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
