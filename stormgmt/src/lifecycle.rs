//! Idempotent volume and snapshot lifecycle.
//!
//! Every operation here can be retried wholesale by its caller after a
//! timeout: creates look for an existing resource first, deletes treat a
//! missing resource as success, and updates only write against the version
//! they observed. Waits on server-side state transitions go through
//! [`with_exponential_backoff`] with the client's [`RetryPolicy`] and are
//! bounded by the caller's [`CallContext`].
//!
//! [`RetryPolicy`]: crate::config::RetryPolicy

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::with_exponential_backoff;
use crate::client::Client;
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::types::{
    DiffSkip, Lookup, Snapshot, SnapshotState, Volume, VolumeSpec, VolumeState, VolumeUpdate,
};

fn warn_if_not_writable(vol: &Volume) {
    if !vol.is_writable() {
        warn!(
            vol_name = %vol.name,
            vol_uuid = %vol.uuid,
            protection = %vol.protection,
            "volume is not currently writable"
        );
    }
}

impl Client {
    /// Create a volume, or adopt an existing one with the same core
    /// properties.
    ///
    /// With `blocking`, waits until the volume leaves `Creating`.
    pub async fn create_volume(
        &self,
        ctx: &CallContext,
        spec: &VolumeSpec,
        blocking: bool,
    ) -> Result<Volume> {
        spec.validate()?;
        let mut spec = spec.clone();
        spec.acl = spec.effective_acl();
        let requested = spec.as_volume();

        match self
            .api
            .get_volume(ctx, Lookup::Name(&spec.name), &spec.project_name)
            .await
        {
            Ok(existing) => return self.adopt_volume(ctx, &requested, existing, blocking).await,
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if let Some(snapshot_uuid) = spec.snapshot_uuid {
            self.check_source_snapshot(ctx, &spec, snapshot_uuid).await?;
        }

        let created = self.api.create_volume(ctx, &spec).await?;
        info!(
            client_id = %self.id(),
            vol_name = %created.name,
            vol_uuid = %created.uuid,
            state = %created.state,
            "volume created"
        );
        if created.acl != spec.acl {
            return Err(Error::Internal(format!(
                "volume '{}' was created with ACL {:?} instead of {:?}",
                spec.name, created.acl, spec.acl
            )));
        }

        match created.state {
            VolumeState::Deleting | VolumeState::Updating | VolumeState::Failed => {
                warn!(
                    vol_name = %created.name,
                    state = %created.state,
                    "volume creation returned unexpected state"
                );
                return Err(Error::Internal(format!(
                    "volume '{}' was created in inappropriate state {}",
                    spec.name, created.state
                )));
            }
            VolumeState::Creating if blocking => {}
            VolumeState::Creating | VolumeState::Available => {
                warn_if_not_writable(&created);
                return Ok(created);
            }
            VolumeState::Unknown => {
                return Err(Error::Internal(format!(
                    "volume '{}' was created in unknown state",
                    spec.name
                )));
            }
        }

        let vol = self.wait_volume_created(ctx, &created).await?;
        warn_if_not_writable(&vol);
        Ok(vol)
    }

    async fn adopt_volume(
        &self,
        ctx: &CallContext,
        requested: &Volume,
        existing: Volume,
        blocking: bool,
    ) -> Result<Volume> {
        let skip = DiffSkip {
            uuid: true,
            capacity: false,
        };
        let diffs = requested.explain_diffs_from(&existing, "requested", "existing", skip);
        if !diffs.is_empty() {
            return Err(Error::AlreadyExists(format!(
                "volume '{}' already exists with different properties: {}",
                existing.name,
                diffs.join(", ")
            )));
        }
        if existing.acl != requested.acl {
            warn!(
                vol_name = %existing.name,
                vol_uuid = %existing.uuid,
                existing_acl = ?existing.acl,
                requested_acl = ?requested.acl,
                "existing volume has a different ACL"
            );
        }
        debug!(vol_name = %existing.name, state = %existing.state, "volume already exists");

        match existing.state {
            VolumeState::Available | VolumeState::Updating => {
                warn_if_not_writable(&existing);
                Ok(existing)
            }
            VolumeState::Creating if blocking => {
                let vol = self.wait_volume_created(ctx, &existing).await?;
                warn_if_not_writable(&vol);
                Ok(vol)
            }
            VolumeState::Creating => Ok(existing),
            VolumeState::Deleting => Err(Error::Unavailable(format!(
                "volume '{}' is being deleted, try again later",
                existing.name
            ))),
            VolumeState::Failed => Err(Error::Internal(format!(
                "volume '{}' exists in state {}",
                existing.name, existing.state
            ))),
            VolumeState::Unknown => Err(Error::Internal(format!(
                "volume '{}' is in unknown state",
                existing.name
            ))),
        }
    }

    async fn check_source_snapshot(
        &self,
        ctx: &CallContext,
        spec: &VolumeSpec,
        snapshot_uuid: Uuid,
    ) -> Result<()> {
        let snap = match self
            .api
            .get_snapshot(ctx, Lookup::Uuid(snapshot_uuid), &spec.project_name)
            .await
        {
            Ok(snap) => snap,
            Err(Error::NotFound(_)) => {
                return Err(Error::NotFound(format!(
                    "source snapshot {snapshot_uuid} of volume '{}' not found",
                    spec.name
                )));
            }
            Err(e) => return Err(e),
        };
        match snap.state {
            SnapshotState::Available => {}
            SnapshotState::Creating => {
                return Err(Error::Unavailable(format!(
                    "source snapshot '{}' is still being created",
                    snap.name
                )));
            }
            state => {
                return Err(Error::InvalidArgument(format!(
                    "source snapshot '{}' is {state}",
                    snap.name
                )));
            }
        }
        if snap.src_vol_replica_count != spec.replica_count {
            return Err(Error::InvalidArgument(format!(
                "replica count {} does not match source snapshot '{}' replica count {}",
                spec.replica_count, snap.name, snap.src_vol_replica_count
            )));
        }
        if snap.src_vol_compression != spec.compression {
            return Err(Error::InvalidArgument(format!(
                "compression {} does not match source snapshot '{}' compression {}",
                spec.compression, snap.name, snap.src_vol_compression
            )));
        }
        if spec.capacity < snap.capacity {
            return Err(Error::InvalidArgument(format!(
                "capacity {} is smaller than source snapshot '{}' capacity {}",
                spec.capacity, snap.name, snap.capacity
            )));
        }
        Ok(())
    }

    async fn wait_volume_created(&self, ctx: &CallContext, original: &Volume) -> Result<Volume> {
        let uuid = original.uuid;
        let project = original.project_name.as_str();
        ctx.run(with_exponential_backoff(&self.retry.create, move || async move {
            let vol = self.api.get_volume(ctx, Lookup::Uuid(uuid), project).await?;

            let diffs =
                original.explain_diffs_from(&vol, "created", "obtained", DiffSkip::default());
            if !diffs.is_empty() {
                return Err(Error::Internal(format!(
                    "volume '{}' properties changed while waiting for it to be created: {}",
                    original.name,
                    diffs.join(", ")
                )));
            }
            if vol.acl != original.acl {
                warn!(
                    vol_name = %vol.name,
                    acl = ?vol.acl,
                    expected = ?original.acl,
                    "volume ACL changed while waiting for creation"
                );
            }

            match vol.state {
                VolumeState::Creating => Ok(None),
                VolumeState::Deleting => Err(Error::Aborted(format!(
                    "volume '{}' appears to have been deleted in parallel",
                    vol.name
                ))),
                VolumeState::Failed => {
                    warn!(vol_name = %vol.name, vol_uuid = %vol.uuid, "volume creation failed");
                    Err(Error::Unavailable(format!(
                        "failed to create volume '{}', try again later",
                        vol.name
                    )))
                }
                // updates are only accepted on available volumes
                VolumeState::Available | VolumeState::Updating => Ok(Some(vol)),
                VolumeState::Unknown => Err(Error::Internal(format!(
                    "volume '{}' entered unknown state while being created",
                    vol.name
                ))),
            }
        }))
        .await
    }

    /// Delete a volume. A volume that is already gone counts as deleted.
    ///
    /// With `blocking`, waits until the server has at least started
    /// deleting, so the name can be reused right away.
    pub async fn delete_volume(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        project: &str,
        blocking: bool,
    ) -> Result<()> {
        let vol = match self.api.get_volume(ctx, Lookup::Uuid(uuid), project).await {
            Ok(vol) => vol,
            Err(Error::NotFound(_)) => {
                debug!(vol_uuid = %uuid, "volume already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if vol.state == VolumeState::Deleting {
            debug!(vol_name = %vol.name, vol_uuid = %uuid, "volume already being deleted");
        } else {
            match self.api.delete_volume(ctx, uuid, project).await {
                Ok(()) => {
                    info!(client_id = %self.id(), vol_name = %vol.name, vol_uuid = %uuid, "volume deleted");
                }
                Err(Error::NotFound(_)) => return Ok(()),
                Err(Error::InvalidArgument(msg)) => {
                    error!(vol_uuid = %uuid, error = %msg, "volume delete refused on bad argument");
                    return Err(Error::Internal(format!(
                        "failed to delete volume {uuid}: {msg}"
                    )));
                }
                Err(Error::FailedPrecondition(msg)) => {
                    debug!(vol_uuid = %uuid, error = %msg, "volume delete refused on precondition");
                    return Err(Error::Unavailable(format!(
                        "delete of volume {uuid} transiently failed: {msg}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        if !blocking {
            return Ok(());
        }

        ctx.run(with_exponential_backoff(&self.retry.delete, move || async move {
            let vol = match self.api.get_volume(ctx, Lookup::Uuid(uuid), project).await {
                Ok(vol) => vol,
                Err(Error::NotFound(_)) => return Ok(Some(())),
                Err(e) => return Err(e),
            };
            match vol.state {
                VolumeState::Available => Ok(None),
                VolumeState::Creating | VolumeState::Updating => {
                    warn!(
                        vol_name = %vol.name,
                        state = %vol.state,
                        "volume in unexpected state after delete"
                    );
                    Err(Error::Unavailable(format!(
                        "failed to delete volume '{}', try again later",
                        vol.name
                    )))
                }
                VolumeState::Failed | VolumeState::Deleting => Ok(Some(())),
                VolumeState::Unknown => Err(Error::Internal(format!(
                    "volume '{}' entered unknown state while being deleted",
                    vol.name
                ))),
            }
        }))
        .await
    }

    /// Read-decide-write loop guarded by the volume's ETag.
    ///
    /// `hook` sees the current volume and returns the change it still wants,
    /// or `None` once the volume is as desired. The loop ends when the hook
    /// returns `None`; its errors are returned unchanged.
    pub async fn update_volume<H>(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        project: &str,
        hook: H,
    ) -> Result<Volume>
    where
        H: FnMut(&Volume) -> Result<Option<VolumeUpdate>> + Send,
    {
        let hook = Mutex::new(hook);
        let hook = &hook;
        ctx.run(with_exponential_backoff(&self.retry.update, move || async move {
            ctx.check()?;
            self.update_volume_once(ctx, uuid, project, hook).await
        }))
        .await
    }

    /// One fetch, decide and write cycle. `Ok(None)` asks for another cycle.
    async fn update_volume_once<H>(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        project: &str,
        hook: &Mutex<H>,
    ) -> Result<Option<Volume>>
    where
        H: FnMut(&Volume) -> Result<Option<VolumeUpdate>> + Send,
    {
        let vol = match self.api.get_volume(ctx, Lookup::Uuid(uuid), project).await {
            Ok(vol) => vol,
            Err(Error::Unavailable(msg)) => {
                debug!(vol_uuid = %uuid, error = %msg, "volume fetch unavailable, retrying");
                return Ok(None);
            }
            Err(e @ (Error::NotFound(_) | Error::Canceled(_) | Error::DeadlineExceeded(_))) => {
                return Err(e);
            }
            Err(e) => {
                error!(vol_uuid = %uuid, error = %e, "unexpected error on volume fetch");
                return Err(Error::Unknown(format!("failed to get volume {uuid}: {e}")));
            }
        };

        match vol.state {
            VolumeState::Creating => {
                warn!(vol_name = %vol.name, vol_uuid = %uuid, "volume is still being created");
                return Ok(None);
            }
            VolumeState::Updating => return Ok(None),
            VolumeState::Deleting | VolumeState::Failed => {
                return Err(Error::NotFound(format!("no such volume {uuid}")));
            }
            VolumeState::Available => {}
            VolumeState::Unknown => {
                return Err(Error::Internal(format!(
                    "cannot update volume '{}' in unknown state",
                    vol.name
                )));
            }
        }

        let decision = {
            let mut hook = hook.lock();
            (*hook)(&vol)
        };
        let update = match decision {
            Ok(Some(update)) => update,
            Ok(None) => {
                debug!(vol_name = %vol.name, "no further volume update requested");
                return Ok(Some(vol));
            }
            Err(e) => {
                debug!(vol_name = %vol.name, error = %e, "volume update aborted by hook");
                return Err(e);
            }
        };
        if update.is_empty() {
            warn!(vol_name = %vol.name, "volume update requested with no changes");
            return Ok(Some(vol));
        }

        ctx.check()?;
        debug!(
            vol_name = %vol.name,
            vol_uuid = %uuid,
            etag = %vol.etag,
            acl_src = ?vol.acl,
            acl_tgt = ?update.acl,
            capacity_src = vol.capacity,
            capacity_tgt = ?update.capacity,
            "updating volume"
        );
        match self
            .api
            .update_volume(ctx, uuid, project, &update, &vol.etag)
            .await
        {
            Ok(()) => {}
            Err(e @ Error::NotFound(_)) => return Err(e),
            Err(Error::Unavailable(msg)) => {
                debug!(vol_uuid = %uuid, error = %msg, "volume update unavailable, retrying");
            }
            // a stale ETag and a wrong lifecycle state look the same here
            Err(Error::FailedPrecondition(msg)) => {
                debug!(vol_uuid = %uuid, error = %msg, "volume update refused on precondition, retrying");
            }
            Err(Error::InvalidArgument(msg)) => {
                error!(vol_uuid = %uuid, error = %msg, "volume update refused on bad argument");
                return Err(Error::Internal(format!(
                    "failed to update volume {uuid}: {msg}"
                )));
            }
            Err(e @ (Error::Canceled(_) | Error::DeadlineExceeded(_))) => return Err(e),
            Err(e) => {
                error!(vol_uuid = %uuid, error = %e, "unexpected error on volume update");
                return Err(Error::Unknown(format!(
                    "failed to update volume {uuid}: {e}"
                )));
            }
        }
        Ok(None)
    }

    /// Create a snapshot of `src_vol_uuid`, or adopt an existing snapshot of
    /// the same volume with the same name.
    pub async fn create_snapshot(
        &self,
        ctx: &CallContext,
        name: &str,
        project: &str,
        src_vol_uuid: Uuid,
        blocking: bool,
    ) -> Result<Snapshot> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name is required".to_string()));
        }

        match self.api.get_snapshot(ctx, Lookup::Name(name), project).await {
            Ok(existing) => {
                if existing.src_vol_uuid != src_vol_uuid {
                    return Err(Error::AlreadyExists(format!(
                        "snapshot '{name}' already exists for volume {} instead of {src_vol_uuid}",
                        existing.src_vol_uuid
                    )));
                }
                debug!(snap_name = %name, state = %existing.state, "snapshot already exists");
                return match existing.state {
                    SnapshotState::Available => Ok(existing),
                    SnapshotState::Creating if blocking => {
                        self.wait_snapshot_created(ctx, &existing, src_vol_uuid).await
                    }
                    SnapshotState::Creating => Ok(existing),
                    SnapshotState::Deleting => Err(Error::Unavailable(format!(
                        "snapshot '{name}' is being deleted, try again later"
                    ))),
                    SnapshotState::Failed | SnapshotState::Unknown => {
                        Err(Error::Internal(format!(
                            "snapshot '{name}' exists in state {}",
                            existing.state
                        )))
                    }
                };
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let snap = match self
            .api
            .create_snapshot(ctx, name, project, src_vol_uuid)
            .await
        {
            Ok(snap) => snap,
            Err(Error::InvalidArgument(msg)) => {
                error!(snap_name = %name, error = %msg, "snapshot create refused on bad argument");
                return Err(Error::Internal(format!(
                    "failed to create snapshot '{name}': {msg}"
                )));
            }
            // usually the source volume is being updated
            Err(Error::FailedPrecondition(msg)) => {
                debug!(snap_name = %name, error = %msg, "snapshot create refused on precondition");
                return Err(Error::Unavailable(format!(
                    "create of snapshot '{name}' transiently failed"
                )));
            }
            Err(e) => return Err(e),
        };
        info!(
            client_id = %self.id(),
            snap_name = %snap.name,
            snap_uuid = %snap.uuid,
            src_vol_uuid = %src_vol_uuid,
            state = %snap.state,
            "snapshot created"
        );

        match snap.state {
            SnapshotState::Deleting | SnapshotState::Failed | SnapshotState::Unknown => {
                Err(Error::Internal(format!(
                    "snapshot '{name}' was created in inappropriate state {}",
                    snap.state
                )))
            }
            SnapshotState::Creating if blocking => {
                self.wait_snapshot_created(ctx, &snap, src_vol_uuid).await
            }
            SnapshotState::Creating | SnapshotState::Available => Ok(snap),
        }
    }

    async fn wait_snapshot_created(
        &self,
        ctx: &CallContext,
        original: &Snapshot,
        src_vol_uuid: Uuid,
    ) -> Result<Snapshot> {
        let uuid = original.uuid;
        let project = original.project_name.as_str();
        let name = original.name.as_str();
        ctx.run(with_exponential_backoff(&self.retry.create, move || async move {
            let snap = self.api.get_snapshot(ctx, Lookup::Uuid(uuid), project).await?;
            if snap.src_vol_uuid != src_vol_uuid {
                return Err(Error::Internal(format!(
                    "snapshot '{name}' source volume changed from {src_vol_uuid} to {}",
                    snap.src_vol_uuid
                )));
            }
            match snap.state {
                SnapshotState::Creating => Ok(None),
                SnapshotState::Deleting => Err(Error::Aborted(format!(
                    "snapshot '{name}' appears to have been deleted in parallel"
                ))),
                SnapshotState::Failed => {
                    warn!(snap_name = %name, snap_uuid = %uuid, "snapshot creation failed");
                    Err(Error::Unavailable(format!(
                        "failed to create snapshot '{name}', try again later"
                    )))
                }
                SnapshotState::Available => Ok(Some(snap)),
                SnapshotState::Unknown => Err(Error::Internal(format!(
                    "snapshot '{name}' entered unknown state while being created"
                ))),
            }
        }))
        .await
    }

    /// Delete a snapshot. A snapshot that is already gone counts as deleted.
    pub async fn delete_snapshot(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        project: &str,
        blocking: bool,
    ) -> Result<()> {
        let snap = match self.api.get_snapshot(ctx, Lookup::Uuid(uuid), project).await {
            Ok(snap) => snap,
            Err(Error::NotFound(_)) => {
                debug!(snap_uuid = %uuid, "snapshot already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if snap.state == SnapshotState::Deleting {
            debug!(snap_name = %snap.name, "snapshot already being deleted");
        } else {
            match self.api.delete_snapshot(ctx, uuid, project).await {
                Ok(()) => {
                    info!(client_id = %self.id(), snap_name = %snap.name, snap_uuid = %uuid, "snapshot deleted");
                }
                Err(Error::NotFound(_)) => return Ok(()),
                Err(Error::InvalidArgument(msg)) => {
                    error!(snap_uuid = %uuid, error = %msg, "snapshot delete refused on bad argument");
                    return Err(Error::Internal(format!(
                        "failed to delete snapshot {uuid}: {msg}"
                    )));
                }
                Err(Error::FailedPrecondition(msg)) => {
                    debug!(snap_uuid = %uuid, error = %msg, "snapshot delete refused on precondition");
                    return Err(Error::Unavailable(format!(
                        "delete of snapshot {uuid} transiently failed"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        if !blocking {
            return Ok(());
        }

        ctx.run(with_exponential_backoff(&self.retry.delete, move || async move {
            let snap = match self.api.get_snapshot(ctx, Lookup::Uuid(uuid), project).await {
                Ok(snap) => snap,
                Err(Error::NotFound(_)) => return Ok(Some(())),
                Err(e) => return Err(e),
            };
            match snap.state {
                SnapshotState::Available => Ok(None),
                SnapshotState::Creating => {
                    warn!(snap_name = %snap.name, "snapshot in unexpected state after delete");
                    Err(Error::Unavailable(format!(
                        "failed to delete snapshot '{}', try again later",
                        snap.name
                    )))
                }
                SnapshotState::Failed | SnapshotState::Deleting => Ok(Some(())),
                SnapshotState::Unknown => Err(Error::Internal(format!(
                    "snapshot '{}' entered unknown state while being deleted",
                    snap.name
                ))),
            }
        }))
        .await
    }
}
