//! Disk manager — brings an instance's persistent disk in line with its spec.
//!
//! Every method takes the instance record as it stands and returns the disk
//! record that should replace it. Nothing here writes persisted state; the
//! caller folds the returned records into its working copy. A failure after
//! the disk already changed comes back as [`DiskError::Incomplete`] carrying
//! the record to keep, so the caller never loses track of an attachment.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_core::{DiskRetention, DiskSpec};
use fleetgrid_agent::AgentClient;
use fleetgrid_cloud::CloudProvider;
use fleetgrid_state::{DiskRecord, DiskState, InstanceRecord, OrphanedDisk, VmRecord};
use tracing::{debug, info, warn};

use crate::error::{DiskError, DiskResult};

/// What `ensure_disk` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskOutcome {
    /// Already as desired.
    Unchanged,
    /// A new disk was created, attached and mounted.
    Created,
    /// The existing disk was reattached to a new VM.
    Attached,
    /// Data moved to a new disk; the old one was orphaned.
    Migrated { from: String, to: String },
    /// The disk is no longer wanted and was orphaned.
    Orphaned { cid: String },
}

/// Result of `ensure_disk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskChange {
    /// The disk the instance owns afterwards.
    pub disk: Option<DiskRecord>,
    pub outcome: DiskOutcome,
    /// Set when a disk left the instance.
    pub orphaned: Option<OrphanedDisk>,
}

/// What happened to the disk of a removed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredDisk {
    /// Final record, `Orphaned` or `Deleted`.
    pub disk: DiskRecord,
    /// Set when the disk is kept for reclamation.
    pub orphaned: Option<OrphanedDisk>,
}

#[derive(Clone)]
pub struct DiskManager {
    cloud: Arc<dyn CloudProvider>,
    agents: AgentClient,
}

impl DiskManager {
    pub fn new(cloud: Arc<dyn CloudProvider>, agents: AgentClient) -> Self {
        Self { cloud, agents }
    }

    /// Make the instance's disk match `desired` on its current VM.
    pub async fn ensure_disk(
        &self,
        instance: &InstanceRecord,
        desired: Option<&DiskSpec>,
    ) -> DiskResult<DiskChange> {
        let current = instance.disk.as_ref();
        match (current, desired) {
            (None, None) => Ok(unchanged(None)),
            (Some(disk), None) => self.orphan(instance, disk).await,
            (None, Some(spec)) => {
                let vm = vm_of(instance)?;
                let disk = self.provision(vm, spec).await?;
                info!(instance = %instance.name(), disk = %disk.cid, "persistent disk created");
                Ok(DiskChange {
                    disk: Some(disk),
                    outcome: DiskOutcome::Created,
                    orphaned: None,
                })
            }
            (Some(disk), Some(spec)) => {
                let vm = vm_of(instance)?;
                let (disk, reattached) = if disk.is_attached_to(&vm.cid) {
                    (disk.clone(), false)
                } else {
                    (self.reattach(vm, disk).await?, true)
                };

                if disk.matches(spec) {
                    if reattached {
                        info!(instance = %instance.name(), disk = %disk.cid, "persistent disk reattached");
                        return Ok(DiskChange {
                            disk: Some(disk),
                            outcome: DiskOutcome::Attached,
                            orphaned: None,
                        });
                    }
                    return Ok(unchanged(Some(disk)));
                }
                match self.migrate(instance, vm, disk.clone(), spec).await {
                    Err(e) if reattached && e.disk().is_none() => Err(e.incomplete(disk)),
                    other => other,
                }
            }
        }
    }

    /// Unmount and detach the disk from the instance's VM ahead of the VM
    /// being replaced. Returns the updated record.
    pub async fn detach(&self, instance: &InstanceRecord) -> DiskResult<Option<DiskRecord>> {
        let Some(disk) = instance.disk.as_ref() else {
            return Ok(None);
        };
        let Some(vm) = instance.vm.as_ref() else {
            return Ok(Some(disk.clone()));
        };
        if !disk.is_held_by(&vm.cid) {
            return Ok(Some(disk.clone()));
        }

        if disk.state == DiskState::Attached {
            self.agents.unmount_disk(&vm.agent_id, &disk.cid).await?;
        }
        self.cloud
            .detach_disk(&vm.cid, &disk.cid)
            .await
            .map_err(|e| DiskError::Detach(e).incomplete(detaching(disk)))?;
        debug!(instance = %instance.name(), disk = %disk.cid, vm = %vm.cid, "persistent disk detached");
        Ok(Some(detached(disk)))
    }

    /// Dispose of a removed instance's disk per `retention`.
    ///
    /// The agent may already be gone, so unmount failures are logged and
    /// ignored; the cloud detach must succeed.
    pub async fn retire(
        &self,
        instance: &InstanceRecord,
        retention: DiskRetention,
    ) -> DiskResult<Option<RetiredDisk>> {
        let Some(current) = instance.disk.as_ref() else {
            return Ok(None);
        };

        let mut disk = current.clone();
        if let Some(vm) = instance.vm.as_ref()
            && disk.is_held_by(&vm.cid)
        {
            if disk.state == DiskState::Attached
                && let Err(e) = self.agents.unmount_disk(&vm.agent_id, &disk.cid).await
            {
                warn!(instance = %instance.name(), disk = %disk.cid, error = %e, "unmount failed, detaching anyway");
            }
            self.cloud
                .detach_disk(&vm.cid, &disk.cid)
                .await
                .map_err(|e| DiskError::Detach(e).incomplete(detaching(&disk)))?;
            disk = detached(&disk);
        }

        match retention {
            DiskRetention::Orphan => {
                info!(instance = %instance.name(), disk = %disk.cid, "persistent disk orphaned");
                Ok(Some(RetiredDisk {
                    orphaned: Some(orphaned(instance, &disk)),
                    disk: DiskRecord {
                        state: DiskState::Orphaned,
                        ..disk
                    },
                }))
            }
            DiskRetention::Delete => {
                if let Err(e) = self.cloud.delete_disk(&disk.cid).await {
                    return Err(DiskError::Delete(e).incomplete(disk));
                }
                info!(instance = %instance.name(), disk = %disk.cid, "persistent disk deleted");
                Ok(Some(RetiredDisk {
                    disk: DiskRecord {
                        state: DiskState::Deleted,
                        ..disk
                    },
                    orphaned: None,
                }))
            }
        }
    }

    /// Create, attach and mount a fresh disk. Undoes its own partial work.
    async fn provision(&self, vm: &VmRecord, spec: &DiskSpec) -> DiskResult<DiskRecord> {
        let handle = self
            .cloud
            .create_disk(spec)
            .await
            .map_err(DiskError::Creation)?;

        if let Err(e) = self.cloud.attach_disk(&vm.cid, &handle.cid).await {
            self.discard(&handle.cid, None).await;
            return Err(DiskError::Attach(e));
        }
        if let Err(e) = self.agents.mount_disk(&vm.agent_id, &handle.cid).await {
            self.discard(&handle.cid, Some(vm)).await;
            return Err(e.into());
        }

        Ok(DiskRecord {
            cid: handle.cid,
            size_mb: spec.size_mb,
            disk_type: spec.disk_type.clone(),
            state: DiskState::Attached,
            attached_to: Some(vm.cid.clone()),
        })
    }

    /// Attach and mount `disk` on `vm`. A disk left `Detaching` on `vm` by
    /// an earlier failure only needs the mount.
    async fn reattach(&self, vm: &VmRecord, disk: &DiskRecord) -> DiskResult<DiskRecord> {
        if !disk.is_held_by(&vm.cid) {
            if let Some(old_vm) = disk.attached_to.as_deref()
                && old_vm != vm.cid
                && let Err(e) = self.cloud.detach_disk(old_vm, &disk.cid).await
            {
                warn!(disk = %disk.cid, vm = %old_vm, error = %e, "stale attachment not cleared");
            }
            self.cloud
                .attach_disk(&vm.cid, &disk.cid)
                .await
                .map_err(DiskError::Attach)?;
        }
        if let Err(e) = self.agents.mount_disk(&vm.agent_id, &disk.cid).await {
            let left = match self.cloud.detach_disk(&vm.cid, &disk.cid).await {
                Ok(()) => detached(disk),
                Err(detach_err) => {
                    warn!(disk = %disk.cid, error = %detach_err, "detach after failed mount failed");
                    DiskRecord {
                        state: DiskState::Detaching,
                        attached_to: Some(vm.cid.clone()),
                        ..disk.clone()
                    }
                }
            };
            return Err(DiskError::from(e).incomplete(left));
        }
        Ok(DiskRecord {
            state: DiskState::Attached,
            attached_to: Some(vm.cid.clone()),
            ..disk.clone()
        })
    }

    /// Move data from `old` (attached and mounted) to a new disk of `spec`.
    ///
    /// Any failure after the new disk exists removes the new disk and leaves
    /// `old` attached and mounted.
    async fn migrate(
        &self,
        instance: &InstanceRecord,
        vm: &VmRecord,
        old: DiskRecord,
        spec: &DiskSpec,
    ) -> DiskResult<DiskChange> {
        info!(
            instance = %instance.name(),
            disk = %old.cid,
            from_mb = old.size_mb,
            to_mb = spec.size_mb,
            "migrating persistent disk"
        );
        let new = self.provision(vm, spec).await?;

        let copied = async {
            self.agents
                .migrate_disk(&vm.agent_id, &old.cid, &new.cid)
                .await?;
            self.agents.unmount_disk(&vm.agent_id, &old.cid).await?;
            if let Err(e) = self.cloud.detach_disk(&vm.cid, &old.cid).await {
                if let Err(mount_err) = self.agents.mount_disk(&vm.agent_id, &old.cid).await {
                    warn!(disk = %old.cid, error = %mount_err, "remount of old disk failed");
                    return Err(DiskError::Detach(e).incomplete(detaching(&old)));
                }
                return Err(DiskError::Detach(e));
            }
            Ok::<(), DiskError>(())
        }
        .await;

        if let Err(e) = copied {
            warn!(instance = %instance.name(), disk = %new.cid, error = %e, "disk migration failed, discarding new disk");
            self.discard(&new.cid, Some(vm)).await;
            return Err(e);
        }

        let from = old.cid.clone();
        info!(instance = %instance.name(), from = %from, to = %new.cid, "persistent disk migrated");
        Ok(DiskChange {
            outcome: DiskOutcome::Migrated {
                from,
                to: new.cid.clone(),
            },
            orphaned: Some(orphaned(instance, &detached(&old))),
            disk: Some(new),
        })
    }

    async fn orphan(&self, instance: &InstanceRecord, disk: &DiskRecord) -> DiskResult<DiskChange> {
        let disk = match self.detach(instance).await? {
            Some(d) => d,
            None => disk.clone(),
        };
        info!(instance = %instance.name(), disk = %disk.cid, "persistent disk no longer wanted, orphaned");
        Ok(DiskChange {
            disk: None,
            outcome: DiskOutcome::Orphaned {
                cid: disk.cid.clone(),
            },
            orphaned: Some(orphaned(instance, &disk)),
        })
    }

    /// Best-effort removal of a disk this manager just created.
    async fn discard(&self, disk_cid: &str, vm: Option<&VmRecord>) {
        if let Some(vm) = vm {
            if let Err(e) = self.agents.unmount_disk(&vm.agent_id, disk_cid).await {
                warn!(disk = %disk_cid, error = %e, "rollback unmount failed");
            }
            if let Err(e) = self.cloud.detach_disk(&vm.cid, disk_cid).await {
                warn!(disk = %disk_cid, error = %e, "rollback detach failed");
            }
        }
        if let Err(e) = self.cloud.delete_disk(disk_cid).await {
            warn!(disk = %disk_cid, error = %e, "rollback delete failed");
        }
    }
}

fn vm_of(instance: &InstanceRecord) -> DiskResult<&VmRecord> {
    instance.vm.as_ref().ok_or_else(|| DiskError::NoVm {
        instance: instance.name(),
    })
}

fn unchanged(disk: Option<DiskRecord>) -> DiskChange {
    DiskChange {
        disk,
        outcome: DiskOutcome::Unchanged,
        orphaned: None,
    }
}

/// Unmounted, still attached where it was.
fn detaching(disk: &DiskRecord) -> DiskRecord {
    DiskRecord {
        state: DiskState::Detaching,
        ..disk.clone()
    }
}

fn detached(disk: &DiskRecord) -> DiskRecord {
    DiskRecord {
        state: DiskState::Detached,
        attached_to: None,
        ..disk.clone()
    }
}

fn orphaned(instance: &InstanceRecord, disk: &DiskRecord) -> OrphanedDisk {
    OrphanedDisk {
        cid: disk.cid.clone(),
        size_mb: disk.size_mb,
        disk_type: disk.disk_type.clone(),
        deployment: instance.deployment.clone(),
        instance: instance.name(),
        orphaned_at: epoch_secs(),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
