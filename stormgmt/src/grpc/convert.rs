//! Conversions between wire messages and domain types.
//!
//! Everything coming off the wire is validated here; a malformed response
//! is an `Internal` error rather than something the lifecycle has to guard
//! against.

use chrono::{DateTime, Utc};
use mgmtapi as wire;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{
    ClusterInfo, Lookup, MAX_REPLICA_COUNT, Node, NodeState, Snapshot, SnapshotState, Volume,
    VolumeProtection, VolumeSpec, VolumeState, VolumeUpdate, normalize_acl,
};

fn bad_volume(msg: String) -> Error {
    Error::Internal(format!("got bad volume from server: {msg}"))
}

fn bad_snapshot(msg: String) -> Error {
    Error::Internal(format!("got bad snapshot from server: {msg}"))
}

fn parse_uuid(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s).ok().filter(|u| !u.is_nil())
}

pub fn volume_from_wire(v: wire::Volume, expected: Option<Lookup<'_>>) -> Result<Volume> {
    if v.name.is_empty() {
        return Err(bad_volume("empty name".to_string()));
    }
    let uuid = parse_uuid(&v.uuid)
        .ok_or_else(|| bad_volume(format!("'{}' has invalid UUID '{}'", v.name, v.uuid)))?;
    match expected {
        Some(Lookup::Name(name)) if name != v.name => {
            return Err(Error::Internal(format!(
                "got wrong volume from server: '{}' instead of '{name}'",
                v.name
            )));
        }
        Some(Lookup::Uuid(want)) if want != uuid => {
            return Err(Error::Internal(format!(
                "got wrong volume '{}' from server: UUID {uuid} instead of {want}",
                v.name
            )));
        }
        _ => {}
    }

    let state = match wire::VolumeState::try_from(v.state) {
        Ok(wire::VolumeState::Creating) => VolumeState::Creating,
        Ok(wire::VolumeState::Available) => VolumeState::Available,
        Ok(wire::VolumeState::Deleting) => VolumeState::Deleting,
        Ok(wire::VolumeState::Failed) => VolumeState::Failed,
        Ok(wire::VolumeState::Updating) => VolumeState::Updating,
        _ => {
            return Err(bad_volume(format!(
                "'{}' has unexpected state {}",
                v.name, v.state
            )));
        }
    };

    let protection = match wire::ProtectionState::try_from(v.protection_state) {
        Ok(wire::ProtectionState::FullyProtected) => VolumeProtection::Protected,
        Ok(wire::ProtectionState::Degraded) => VolumeProtection::Degraded,
        Ok(wire::ProtectionState::ReadOnly) => VolumeProtection::ReadOnly,
        Ok(wire::ProtectionState::NotAvailable) => VolumeProtection::NotAvailable,
        // protection is not yet known while the volume is being set up
        Ok(wire::ProtectionState::Unknown) if state == VolumeState::Creating => {
            VolumeProtection::Unknown
        }
        _ => {
            return Err(bad_volume(format!(
                "'{}' has unexpected protection state {}",
                v.name, v.protection_state
            )));
        }
    };

    if v.replica_count == 0 || v.replica_count > MAX_REPLICA_COUNT {
        return Err(bad_volume(format!(
            "'{}' has invalid replica count {}",
            v.name, v.replica_count
        )));
    }

    let compression: bool = v.compression.parse().map_err(|_| {
        bad_volume(format!(
            "'{}' has invalid compression value '{}'",
            v.name, v.compression
        ))
    })?;

    let snapshot_uuid = if v.source_snapshot_uuid.is_empty() {
        None
    } else {
        Some(parse_uuid(&v.source_snapshot_uuid).ok_or_else(|| {
            bad_volume(format!(
                "'{}' has invalid source snapshot UUID '{}'",
                v.name, v.source_snapshot_uuid
            ))
        })?)
    };

    let acl = v.acl.map(|l| normalize_acl(&l.values)).unwrap_or_default();

    Ok(Volume {
        name: v.name,
        uuid,
        replica_count: v.replica_count,
        capacity: v.size,
        compression,
        snapshot_uuid,
        acl,
        state,
        protection,
        etag: v.e_tag,
        project_name: v.project_name,
    })
}

pub fn snapshot_from_wire(s: wire::Snapshot, expected: Option<Lookup<'_>>) -> Result<Snapshot> {
    if s.name.is_empty() {
        return Err(bad_snapshot("empty name".to_string()));
    }
    let uuid = parse_uuid(&s.uuid)
        .ok_or_else(|| bad_snapshot(format!("'{}' has invalid UUID '{}'", s.name, s.uuid)))?;
    match expected {
        Some(Lookup::Name(name)) if name != s.name => {
            return Err(Error::Internal(format!(
                "got wrong snapshot from server: '{}' instead of '{name}'",
                s.name
            )));
        }
        Some(Lookup::Uuid(want)) if want != uuid => {
            return Err(Error::Internal(format!(
                "got wrong snapshot '{}' from server: UUID {uuid} instead of {want}",
                s.name
            )));
        }
        _ => {}
    }
    let src_vol_uuid = parse_uuid(&s.source_volume_uuid).ok_or_else(|| {
        bad_snapshot(format!(
            "'{}' has invalid source volume UUID '{}'",
            s.name, s.source_volume_uuid
        ))
    })?;
    let state = match wire::SnapshotState::try_from(s.state) {
        Ok(wire::SnapshotState::Creating) => SnapshotState::Creating,
        Ok(wire::SnapshotState::Available) => SnapshotState::Available,
        Ok(wire::SnapshotState::Deleting) => SnapshotState::Deleting,
        Ok(wire::SnapshotState::Failed) => SnapshotState::Failed,
        _ => {
            return Err(bad_snapshot(format!(
                "'{}' has unexpected state {}",
                s.name, s.state
            )));
        }
    };
    let creation_time = s
        .creation_time
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.seconds, ts.nanos.max(0) as u32))
        .unwrap_or_else(Utc::now);

    Ok(Snapshot {
        name: s.name,
        uuid,
        capacity: s.size,
        src_vol_uuid,
        src_vol_name: s.source_volume_name,
        src_vol_replica_count: s.replica_count,
        src_vol_compression: s.compression,
        creation_time,
        state,
        etag: s.e_tag,
        project_name: s.project_name,
    })
}

pub fn cluster_info_from_wire(c: wire::ClusterInfo) -> Result<ClusterInfo> {
    let uuid = parse_uuid(&c.uuid)
        .ok_or_else(|| Error::Unknown(format!("got invalid cluster UUID '{}'", c.uuid)))?;
    Ok(ClusterInfo {
        uuid,
        subsys_nqn: c.subsystem_nqn,
        current_max_replicas: c.current_max_replicas,
        max_replicas: c.supported_max_replicas,
        free_capacity: c.free_capacity,
        discovery_endpoints: c.discovery_endpoints,
        api_endpoints: c.api_endpoints,
        nvme_endpoints: c.nvme_endpoints,
    })
}

/// Convert a node listing, reporting every malformed entry at once.
pub fn nodes_from_wire(nodes: Vec<wire::NodeInfo>) -> Result<Vec<Node>> {
    if nodes.is_empty() {
        return Err(Error::Unknown("server returned an empty node list".to_string()));
    }
    let mut out = Vec::with_capacity(nodes.len());
    let mut problems = Vec::new();
    for n in nodes {
        let uuid = parse_uuid(&n.uuid);
        let state = match wire::NodeState::try_from(n.state) {
            Ok(wire::NodeState::Active) => Some(NodeState::Active),
            Ok(wire::NodeState::Activating) => Some(NodeState::Activating),
            Ok(wire::NodeState::Inactive) => Some(NodeState::Inactive),
            Ok(wire::NodeState::Unattached) => Some(NodeState::Unattached),
            Ok(wire::NodeState::Attaching) => Some(NodeState::Attaching),
            Ok(wire::NodeState::Detaching) => Some(NodeState::Detaching),
            _ => None,
        };
        match (uuid, state) {
            (Some(uuid), Some(state)) => out.push(Node {
                name: n.name,
                uuid,
                hostname: n.hostname,
                data_endpoint: n.nvme_endpoint,
                state,
            }),
            (None, _) => problems.push(format!("node '{}' has invalid UUID '{}'", n.name, n.uuid)),
            (_, None) => problems.push(format!("node '{}' has unknown state {}", n.name, n.state)),
        }
    }
    if !problems.is_empty() {
        return Err(Error::Unknown(format!(
            "got bad node list from server: {}",
            problems.join("; ")
        )));
    }
    Ok(out)
}

pub fn create_volume_request(spec: &VolumeSpec) -> wire::CreateVolumeRequest {
    wire::CreateVolumeRequest {
        name: spec.name.clone(),
        size: spec.capacity.to_string(),
        acl: Some(wire::StringList {
            values: spec.acl.clone(),
        }),
        compression: spec.compression.to_string(),
        replica_count: spec.replica_count,
        project_name: spec.project_name.clone(),
        source_snapshot_uuid: spec
            .snapshot_uuid
            .map(|u| u.to_string())
            .unwrap_or_default(),
    }
}

pub fn update_volume_request(
    uuid: Uuid,
    project: &str,
    update: &VolumeUpdate,
) -> wire::UpdateVolumeRequest {
    wire::UpdateVolumeRequest {
        uuid: uuid.to_string(),
        project_name: project.to_string(),
        acl: update.acl.as_ref().map(|acl| wire::StringList {
            values: normalize_acl(acl),
        }),
        size: update.capacity.map(|c| c.to_string()).unwrap_or_default(),
    }
}

pub fn lookup_fields(lookup: Lookup<'_>) -> (String, String) {
    match lookup {
        Lookup::Uuid(uuid) => (uuid.to_string(), String::new()),
        Lookup::Name(name) => (String::new(), name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_volume() -> wire::Volume {
        wire::Volume {
            name: "pvc-1".to_string(),
            uuid: Uuid::new_v4().to_string(),
            state: wire::VolumeState::Available as i32,
            protection_state: wire::ProtectionState::FullyProtected as i32,
            replica_count: 3,
            acl: Some(wire::StringList {
                values: vec!["host-B".to_string(), "host-A".to_string(), "host-B".to_string()],
            }),
            size: 1 << 30,
            compression: "false".to_string(),
            e_tag: "3".to_string(),
            project_name: "default".to_string(),
            source_snapshot_uuid: String::new(),
        }
    }

    #[test]
    fn volume_converts_and_normalizes_acl() {
        let vol = volume_from_wire(wire_volume(), None).unwrap();
        assert_eq!(vol.acl, vec!["host-A", "host-B"]);
        assert_eq!(vol.state, VolumeState::Available);
        assert_eq!(vol.protection, VolumeProtection::Protected);
        assert_eq!(vol.etag, "3");
        assert!(vol.snapshot_uuid.is_none());
    }

    #[test]
    fn volume_rejects_bad_fields() {
        let mut v = wire_volume();
        v.uuid = "not-a-uuid".to_string();
        assert!(matches!(volume_from_wire(v, None), Err(Error::Internal(_))));

        let mut v = wire_volume();
        v.replica_count = MAX_REPLICA_COUNT + 1;
        assert!(volume_from_wire(v, None).is_err());

        let mut v = wire_volume();
        v.compression = "yes".to_string();
        assert!(volume_from_wire(v, None).is_err());

        let mut v = wire_volume();
        v.state = 5;
        assert!(volume_from_wire(v, None).is_err());

        let mut v = wire_volume();
        v.name.clear();
        assert!(volume_from_wire(v, None).is_err());
    }

    #[test]
    fn unknown_protection_only_while_creating() {
        let mut v = wire_volume();
        v.protection_state = wire::ProtectionState::Unknown as i32;
        assert!(volume_from_wire(v.clone(), None).is_err());
        v.state = wire::VolumeState::Creating as i32;
        let vol = volume_from_wire(v, None).unwrap();
        assert_eq!(vol.protection, VolumeProtection::Unknown);
    }

    #[test]
    fn volume_must_match_lookup() {
        let v = wire_volume();
        assert!(volume_from_wire(v.clone(), Some(Lookup::Name("other"))).is_err());
        assert!(volume_from_wire(v.clone(), Some(Lookup::Uuid(Uuid::new_v4()))).is_err());
        assert!(volume_from_wire(v, Some(Lookup::Name("pvc-1"))).is_ok());
    }

    #[test]
    fn snapshot_requires_source_volume() {
        let snap = wire::Snapshot {
            name: "snap-1".to_string(),
            uuid: Uuid::new_v4().to_string(),
            size: 1 << 30,
            state: wire::SnapshotState::Available as i32,
            source_volume_uuid: String::new(),
            ..Default::default()
        };
        assert!(snapshot_from_wire(snap.clone(), None).is_err());
        let snap = wire::Snapshot {
            source_volume_uuid: Uuid::new_v4().to_string(),
            creation_time: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            ..snap
        };
        let converted = snapshot_from_wire(snap, None).unwrap();
        assert_eq!(converted.creation_time.timestamp(), 1_700_000_000);
        assert_eq!(converted.state, SnapshotState::Available);
    }

    #[test]
    fn node_list_collects_all_problems() {
        let good = wire::NodeInfo {
            name: "n1".to_string(),
            uuid: Uuid::new_v4().to_string(),
            state: wire::NodeState::Active as i32,
            ..Default::default()
        };
        assert_eq!(nodes_from_wire(vec![good.clone()]).unwrap().len(), 1);

        let bad_uuid = wire::NodeInfo {
            name: "n2".to_string(),
            uuid: "x".to_string(),
            ..good.clone()
        };
        let bad_state = wire::NodeInfo {
            name: "n3".to_string(),
            state: 42,
            ..good.clone()
        };
        let err = nodes_from_wire(vec![good, bad_uuid, bad_state]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("n2") && msg.contains("n3"), "{msg}");
        assert!(nodes_from_wire(vec![]).is_err());
    }

    #[test]
    fn update_request_is_sparse() {
        let uuid = Uuid::new_v4();
        let req = update_volume_request(
            uuid,
            "p",
            &VolumeUpdate {
                capacity: Some(10),
                ..Default::default()
            },
        );
        assert!(req.acl.is_none());
        assert_eq!(req.size, "10");

        let req = update_volume_request(
            uuid,
            "p",
            &VolumeUpdate {
                acl: Some(vec!["b".to_string(), "a".to_string()]),
                ..Default::default()
            },
        );
        assert_eq!(req.acl.unwrap().values, vec!["a", "b"]);
        assert!(req.size.is_empty());
    }
}
