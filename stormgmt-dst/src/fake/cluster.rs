//! In-memory management API.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use stormgmt::types::normalize_acl;
use stormgmt::{
    CallContext, ClusterInfo, Error, Lookup, ManagementApi, Node, NodeState, Result, Snapshot,
    SnapshotState, Volume, VolumeProtection, VolumeSpec, VolumeState, VolumeUpdate,
};
use uuid::Uuid;

/// Remote operations, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetVersion,
    GetClusterInfo,
    ListNodes,
    GetVolume,
    CreateVolume,
    UpdateVolume,
    DeleteVolume,
    GetSnapshot,
    CreateSnapshot,
    DeleteSnapshot,
}

/// Pending gets of an inserted resource, which never moves on by itself.
const SETTLED: u32 = u32::MAX;

struct StoredVolume {
    vol: Volume,
    /// Gets left before `Creating` or `Deleting` moves on.
    pending_gets: u32,
}

struct StoredSnapshot {
    snap: Snapshot,
    pending_gets: u32,
}

struct ClusterState {
    volumes: HashMap<Uuid, StoredVolume>,
    snapshots: HashMap<Uuid, StoredSnapshot>,
    nodes: Vec<Node>,
    info: ClusterInfo,
    version: String,
    next_etag: u64,
}

impl ClusterState {
    fn bump_etag(&mut self) -> String {
        self.next_etag += 1;
        self.next_etag.to_string()
    }

    fn find_volume(&self, lookup: Lookup<'_>, project: &str) -> Option<Uuid> {
        match lookup {
            Lookup::Uuid(uuid) => self.volumes.contains_key(&uuid).then_some(uuid),
            Lookup::Name(name) => self
                .volumes
                .values()
                .find(|s| s.vol.name == name && s.vol.project_name == project)
                .map(|s| s.vol.uuid),
        }
    }

    fn find_snapshot(&self, lookup: Lookup<'_>, project: &str) -> Option<Uuid> {
        match lookup {
            Lookup::Uuid(uuid) => self.snapshots.contains_key(&uuid).then_some(uuid),
            Lookup::Name(name) => self
                .snapshots
                .values()
                .find(|s| s.snap.name == name && s.snap.project_name == project)
                .map(|s| s.snap.uuid),
        }
    }
}

struct Behavior {
    /// Gets a new resource stays `Creating` for; zero creates it available.
    create_delay: u32,
    /// Gets a deleted resource stays `Deleting` for; zero removes it at once.
    delete_delay: u32,
    latency: Duration,
    /// Probability of any call failing with `Unavailable`.
    flakiness: f64,
    rng: SmallRng,
    faults: HashMap<Op, VecDeque<Error>>,
}

/// In-memory storage cluster.
///
/// New volumes and snapshots start in `Creating` and become `Available`
/// after a scripted number of gets; deletes go through `Deleting` the same
/// way. Updates are checked against the ETag and bump it. Every call is
/// counted per [`Op`], and errors can be queued per operation or injected
/// at random with a seeded generator.
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    behavior: Mutex<Behavior>,
    calls: Mutex<HashMap<Op, u64>>,
    closes: Mutex<u64>,
}

impl FakeCluster {
    pub fn new(seed: u64) -> Self {
        let nodes = (0..3)
            .map(|i| Node {
                name: format!("node-{i}"),
                uuid: Uuid::new_v4(),
                hostname: format!("host-{i}"),
                data_endpoint: format!("10.0.1.{i}:4420"),
                state: NodeState::Active,
            })
            .collect();
        let info = ClusterInfo {
            uuid: Uuid::new_v4(),
            subsys_nqn: "nqn.2016-01.com.example:fake".to_string(),
            current_max_replicas: 3,
            max_replicas: 3,
            free_capacity: 1 << 40,
            discovery_endpoints: vec!["10.0.0.1:8009".to_string()],
            api_endpoints: vec!["10.0.0.1:443".to_string()],
            nvme_endpoints: vec!["10.0.0.1:4420".to_string()],
        };
        Self {
            state: Mutex::new(ClusterState {
                volumes: HashMap::new(),
                snapshots: HashMap::new(),
                nodes,
                info,
                version: "v2.0".to_string(),
                next_etag: 0,
            }),
            behavior: Mutex::new(Behavior {
                create_delay: 0,
                delete_delay: 0,
                latency: Duration::ZERO,
                flakiness: 0.0,
                rng: SmallRng::seed_from_u64(seed),
                faults: HashMap::new(),
            }),
            calls: Mutex::new(HashMap::new()),
            closes: Mutex::new(0),
        }
    }

    pub fn set_create_delay(&self, gets: u32) {
        self.behavior.lock().create_delay = gets;
    }

    pub fn set_delete_delay(&self, gets: u32) {
        self.behavior.lock().delete_delay = gets;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.behavior.lock().latency = latency;
    }

    pub fn set_flakiness(&self, probability: f64) {
        self.behavior.lock().flakiness = probability;
    }

    pub fn set_version(&self, version: &str) {
        self.state.lock().version = version.to_string();
    }

    /// Fail the next call of `op` with `err`. Queued faults fire in order.
    pub fn fail_next(&self, op: Op, err: Error) {
        self.behavior
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self, op: Op) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn closes(&self) -> u64 {
        *self.closes.lock()
    }

    pub fn volume(&self, uuid: Uuid) -> Option<Volume> {
        self.state.lock().volumes.get(&uuid).map(|s| s.vol.clone())
    }

    pub fn snapshot(&self, uuid: Uuid) -> Option<Snapshot> {
        self.state.lock().snapshots.get(&uuid).map(|s| s.snap.clone())
    }

    /// Every stored volume called `name` in `project`, in any state.
    pub fn volumes_named(&self, name: &str, project: &str) -> Vec<Volume> {
        self.state
            .lock()
            .volumes
            .values()
            .filter(|s| s.vol.name == name && s.vol.project_name == project)
            .map(|s| s.vol.clone())
            .collect()
    }

    /// Store `vol` as is, assigning a fresh ETag. It keeps its state, even a
    /// transitional one, until changed with [`mutate_volume`](Self::mutate_volume).
    pub fn insert_volume(&self, mut vol: Volume) -> Volume {
        let mut st = self.state.lock();
        vol.etag = st.bump_etag();
        st.volumes.insert(
            vol.uuid,
            StoredVolume {
                vol: vol.clone(),
                pending_gets: SETTLED,
            },
        );
        vol
    }

    /// Store `snap` as is; like inserted volumes it keeps its state.
    pub fn insert_snapshot(&self, snap: Snapshot) {
        self.state.lock().snapshots.insert(
            snap.uuid,
            StoredSnapshot {
                snap,
                pending_gets: SETTLED,
            },
        );
    }

    /// Change a volume behind the client's back, as another writer would.
    pub fn mutate_volume(&self, uuid: Uuid, f: impl FnOnce(&mut Volume)) -> bool {
        let mut st = self.state.lock();
        let etag = st.bump_etag();
        match st.volumes.get_mut(&uuid) {
            Some(stored) => {
                f(&mut stored.vol);
                stored.vol.etag = etag;
                true
            }
            None => false,
        }
    }

    /// Count the call, wait out the latency and return any injected fault.
    async fn enter(&self, op: Op) -> Result<()> {
        *self.calls.lock().entry(op).or_default() += 1;
        let (latency, fault) = {
            let mut b = self.behavior.lock();
            let queued = b.faults.get_mut(&op).and_then(|q| q.pop_front());
            let fault = match queued {
                Some(err) => Some(err),
                None if b.flakiness > 0.0 => {
                    let p = b.flakiness;
                    b.rng
                        .random_bool(p.min(1.0))
                        .then(|| Error::Unavailable(format!("injected {op:?} failure")))
                }
                None => None,
            };
            (b.latency, fault)
        };
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn delays(&self) -> (u32, u32) {
        let b = self.behavior.lock();
        (b.create_delay, b.delete_delay)
    }
}

fn advance_volume(stored: &mut StoredVolume) -> bool {
    if stored.pending_gets == SETTLED {
        return false;
    }
    if stored.pending_gets > 0 {
        stored.pending_gets -= 1;
    }
    if stored.pending_gets > 0 {
        return false;
    }
    match stored.vol.state {
        VolumeState::Creating => {
            stored.vol.state = VolumeState::Available;
            stored.vol.protection = VolumeProtection::Protected;
            false
        }
        VolumeState::Deleting => true,
        _ => false,
    }
}

fn advance_snapshot(stored: &mut StoredSnapshot) -> bool {
    if stored.pending_gets == SETTLED {
        return false;
    }
    if stored.pending_gets > 0 {
        stored.pending_gets -= 1;
    }
    if stored.pending_gets > 0 {
        return false;
    }
    match stored.snap.state {
        SnapshotState::Creating => {
            stored.snap.state = SnapshotState::Available;
            false
        }
        SnapshotState::Deleting => true,
        _ => false,
    }
}

#[async_trait]
impl ManagementApi for FakeCluster {
    async fn get_version(&self, ctx: &CallContext) -> Result<String> {
        ctx.check()?;
        self.enter(Op::GetVersion).await?;
        Ok(self.state.lock().version.clone())
    }

    async fn get_cluster_info(&self, ctx: &CallContext) -> Result<ClusterInfo> {
        ctx.check()?;
        self.enter(Op::GetClusterInfo).await?;
        Ok(self.state.lock().info.clone())
    }

    async fn list_nodes(&self, ctx: &CallContext) -> Result<Vec<Node>> {
        ctx.check()?;
        self.enter(Op::ListNodes).await?;
        Ok(self.state.lock().nodes.clone())
    }

    async fn get_volume(
        &self,
        ctx: &CallContext,
        lookup: Lookup<'_>,
        project: &str,
    ) -> Result<Volume> {
        ctx.check()?;
        self.enter(Op::GetVolume).await?;
        let mut st = self.state.lock();
        let not_found = || Error::NotFound(format!("volume {lookup} not found"));
        let uuid = st.find_volume(lookup, project).ok_or_else(not_found)?;
        let gone = match st.volumes.get_mut(&uuid) {
            Some(stored) => advance_volume(stored),
            None => return Err(not_found()),
        };
        if gone {
            st.volumes.remove(&uuid);
            return Err(not_found());
        }
        st.volumes
            .get(&uuid)
            .map(|s| s.vol.clone())
            .ok_or_else(not_found)
    }

    async fn create_volume(&self, ctx: &CallContext, spec: &VolumeSpec) -> Result<Volume> {
        ctx.check()?;
        self.enter(Op::CreateVolume).await?;
        let (create_delay, _) = self.delays();
        let mut st = self.state.lock();
        if st
            .find_volume(Lookup::Name(&spec.name), &spec.project_name)
            .is_some()
        {
            return Err(Error::AlreadyExists(format!(
                "volume '{}' already exists",
                spec.name
            )));
        }
        if let Some(snap_uuid) = spec.snapshot_uuid {
            if !st.snapshots.contains_key(&snap_uuid) {
                return Err(Error::NotFound(format!("snapshot {snap_uuid} not found")));
            }
        }
        let creating = create_delay > 0;
        let vol = Volume {
            name: spec.name.clone(),
            uuid: Uuid::new_v4(),
            replica_count: spec.replica_count,
            capacity: spec.capacity,
            compression: spec.compression,
            snapshot_uuid: spec.snapshot_uuid,
            acl: normalize_acl(&spec.acl),
            state: if creating {
                VolumeState::Creating
            } else {
                VolumeState::Available
            },
            protection: if creating {
                VolumeProtection::Unknown
            } else {
                VolumeProtection::Protected
            },
            etag: st.bump_etag(),
            project_name: spec.project_name.clone(),
        };
        st.volumes.insert(
            vol.uuid,
            StoredVolume {
                vol: vol.clone(),
                pending_gets: create_delay,
            },
        );
        Ok(vol)
    }

    async fn update_volume(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        _project: &str,
        update: &VolumeUpdate,
        etag: &str,
    ) -> Result<()> {
        ctx.check()?;
        self.enter(Op::UpdateVolume).await?;
        let mut st = self.state.lock();
        let new_etag = st.bump_etag();
        let stored = st
            .volumes
            .get_mut(&uuid)
            .ok_or_else(|| Error::NotFound(format!("volume {uuid} not found")))?;
        if stored.vol.etag != etag {
            return Err(Error::FailedPrecondition(format!(
                "etag mismatch: have {}, got {etag}",
                stored.vol.etag
            )));
        }
        if stored.vol.state != VolumeState::Available {
            return Err(Error::FailedPrecondition(format!(
                "volume is {}",
                stored.vol.state
            )));
        }
        if let Some(capacity) = update.capacity {
            if capacity < stored.vol.capacity {
                return Err(Error::InvalidArgument("cannot shrink volume".to_string()));
            }
            stored.vol.capacity = capacity;
        }
        if let Some(acl) = &update.acl {
            stored.vol.acl = normalize_acl(acl);
        }
        stored.vol.etag = new_etag;
        Ok(())
    }

    async fn delete_volume(&self, ctx: &CallContext, uuid: Uuid, _project: &str) -> Result<()> {
        ctx.check()?;
        self.enter(Op::DeleteVolume).await?;
        let (_, delete_delay) = self.delays();
        let mut st = self.state.lock();
        let stored = st
            .volumes
            .get_mut(&uuid)
            .ok_or_else(|| Error::NotFound(format!("volume {uuid} not found")))?;
        if matches!(
            stored.vol.state,
            VolumeState::Creating | VolumeState::Updating
        ) {
            return Err(Error::FailedPrecondition(format!(
                "volume is {}",
                stored.vol.state
            )));
        }
        if delete_delay == 0 {
            st.volumes.remove(&uuid);
        } else {
            stored.vol.state = VolumeState::Deleting;
            stored.pending_gets = delete_delay;
        }
        Ok(())
    }

    async fn get_snapshot(
        &self,
        ctx: &CallContext,
        lookup: Lookup<'_>,
        project: &str,
    ) -> Result<Snapshot> {
        ctx.check()?;
        self.enter(Op::GetSnapshot).await?;
        let mut st = self.state.lock();
        let not_found = || Error::NotFound(format!("snapshot {lookup} not found"));
        let uuid = st.find_snapshot(lookup, project).ok_or_else(not_found)?;
        let gone = match st.snapshots.get_mut(&uuid) {
            Some(stored) => advance_snapshot(stored),
            None => return Err(not_found()),
        };
        if gone {
            st.snapshots.remove(&uuid);
            return Err(not_found());
        }
        st.snapshots
            .get(&uuid)
            .map(|s| s.snap.clone())
            .ok_or_else(not_found)
    }

    async fn create_snapshot(
        &self,
        ctx: &CallContext,
        name: &str,
        project: &str,
        src_vol_uuid: Uuid,
    ) -> Result<Snapshot> {
        ctx.check()?;
        self.enter(Op::CreateSnapshot).await?;
        let (create_delay, _) = self.delays();
        let mut st = self.state.lock();
        if st.find_snapshot(Lookup::Name(name), project).is_some() {
            return Err(Error::AlreadyExists(format!("snapshot '{name}' already exists")));
        }
        let src = st
            .volumes
            .get(&src_vol_uuid)
            .map(|s| s.vol.clone())
            .ok_or_else(|| Error::NotFound(format!("volume {src_vol_uuid} not found")))?;
        if src.state != VolumeState::Available {
            return Err(Error::FailedPrecondition(format!(
                "source volume '{}' is {}",
                src.name, src.state
            )));
        }
        let snap = Snapshot {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            capacity: src.capacity,
            src_vol_uuid,
            src_vol_name: src.name,
            src_vol_replica_count: src.replica_count,
            src_vol_compression: src.compression,
            creation_time: Utc::now(),
            state: if create_delay > 0 {
                SnapshotState::Creating
            } else {
                SnapshotState::Available
            },
            etag: st.bump_etag(),
            project_name: project.to_string(),
        };
        st.snapshots.insert(
            snap.uuid,
            StoredSnapshot {
                snap: snap.clone(),
                pending_gets: create_delay,
            },
        );
        Ok(snap)
    }

    async fn delete_snapshot(&self, ctx: &CallContext, uuid: Uuid, _project: &str) -> Result<()> {
        ctx.check()?;
        self.enter(Op::DeleteSnapshot).await?;
        let (_, delete_delay) = self.delays();
        let mut st = self.state.lock();
        let stored = st
            .snapshots
            .get_mut(&uuid)
            .ok_or_else(|| Error::NotFound(format!("snapshot {uuid} not found")))?;
        if stored.snap.state == SnapshotState::Creating {
            return Err(Error::FailedPrecondition("snapshot is Creating".to_string()));
        }
        if delete_delay == 0 {
            st.snapshots.remove(&uuid);
        } else {
            stored.snap.state = SnapshotState::Deleting;
            stored.pending_gets = delete_delay;
        }
        Ok(())
    }

    fn close(&self) {
        *self.closes.lock() += 1;
    }
}
