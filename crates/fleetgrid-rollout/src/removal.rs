//! Deprovisioning instances that left the manifest.
//!
//! Order per instance: drain and stop (best effort, the agent may already
//! be gone), retire the persistent disk, delete the VM, release addresses.
//! A failure leaves the record in place with whatever was already undone
//! cleared, so the next run picks up where this one stopped.

use fleet_core::{DiskRetention, DrainHook};
use fleetgrid_state::{InstanceRecord, OrphanedDisk};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::Collaborators;
use crate::error::{UpdateError, UpdateResult};
use crate::task_set::ParallelTaskSet;

/// An instance to take down.
#[derive(Debug, Clone)]
pub struct RemovalPlan {
    pub record: InstanceRecord,
    pub retention: DiskRetention,
    pub drain: Option<DrainHook>,
}

/// Teardown phase a removal failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    RetiringDisk,
    DeletingVm,
    ReleasingAddresses,
}

#[derive(Debug)]
pub struct RemovalOutcome {
    /// Store key of the instance.
    pub key: String,
    pub name: String,
    pub index: u32,
    /// Remaining record when removal did not complete.
    pub record: Option<InstanceRecord>,
    pub orphaned: Option<OrphanedDisk>,
    /// Set when teardown itself failed; cancelled removals never started.
    pub failed_step: Option<TeardownStep>,
    pub error: Option<UpdateError>,
}

impl RemovalOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Take one instance down completely.
pub async fn remove_instance(ctx: &Collaborators, plan: RemovalPlan) -> RemovalOutcome {
    let mut record = plan.record;
    let key = record.table_key();
    let name = record.name();
    let index = record.index;
    let mut orphaned = None;

    let result = teardown(ctx, &mut record, plan.retention, plan.drain.as_ref(), &mut orphaned).await;
    match result {
        Ok(()) => {
            info!(deployment = %record.deployment, instance = %name, "instance removed");
            RemovalOutcome {
                key,
                name,
                index,
                record: None,
                orphaned,
                failed_step: None,
                error: None,
            }
        }
        Err((step, e)) => {
            warn!(deployment = %record.deployment, instance = %name, ?step, error = %e, "instance removal failed");
            RemovalOutcome {
                key,
                name,
                index,
                record: Some(record),
                orphaned,
                failed_step: Some(step),
                error: Some(e),
            }
        }
    }
}

async fn teardown(
    ctx: &Collaborators,
    record: &mut InstanceRecord,
    retention: DiskRetention,
    drain: Option<&DrainHook>,
    orphaned: &mut Option<OrphanedDisk>,
) -> Result<(), (TeardownStep, UpdateError)> {
    if let Some(vm) = record.vm.as_ref() {
        if let Some(hook) = drain {
            match ctx.agents.drain(&vm.agent_id, hook).await {
                Ok(wait) => tokio::time::sleep(wait).await,
                Err(e) => warn!(instance = %record.name(), error = %e, "drain failed, continuing"),
            }
        }
        if let Err(e) = ctx.agents.stop(&vm.agent_id).await {
            warn!(instance = %record.name(), error = %e, "stop failed, continuing");
        }
    }

    match ctx.disks.retire(record, retention).await {
        Ok(Some(retired)) => {
            debug!(instance = %record.name(), disk = %retired.disk.cid, state = ?retired.disk.state, "disk retired");
            *orphaned = retired.orphaned;
        }
        Ok(None) => {}
        Err(e) => {
            if let Some(disk) = e.disk() {
                record.disk = Some(disk.clone());
            }
            return Err((TeardownStep::RetiringDisk, UpdateError::from(e)));
        }
    }
    record.disk = None;

    if let Some(vm) = record.vm.as_ref() {
        ctx.cloud
            .delete_vm(&vm.cid)
            .await
            .map_err(|e| (TeardownStep::DeletingVm, UpdateError::from(e)))?;
        info!(instance = %record.name(), vm = %vm.cid, "vm deleted");
        record.vm = None;
    }

    release_addresses(ctx, record)
        .await
        .map_err(|e| (TeardownStep::ReleasingAddresses, e))
}

async fn release_addresses(ctx: &Collaborators, record: &mut InstanceRecord) -> UpdateResult<()> {
    while let Some(reservation) = record.reservations.first().cloned() {
        ctx.network.release(&reservation).await?;
        record.reservations.remove(0);
    }
    Ok(())
}

/// Remove `plans` with at most `max_in_flight` in progress. Plans not
/// started before cancellation come back untouched as failed outcomes.
pub async fn remove_instances(
    ctx: &Collaborators,
    plans: Vec<RemovalPlan>,
    max_in_flight: usize,
    cancel: watch::Receiver<bool>,
) -> Vec<RemovalOutcome> {
    let mut set = ParallelTaskSet::new_with_parallelism(max_in_flight);
    let mut outcomes = Vec::with_capacity(plans.len());

    for plan in plans {
        outcomes.extend(set.wait_for_slot().await);
        if *cancel.borrow() {
            outcomes.push(RemovalOutcome {
                key: plan.record.table_key(),
                name: plan.record.name(),
                index: plan.record.index,
                record: Some(plan.record),
                orphaned: None,
                failed_step: None,
                error: Some(UpdateError::Cancelled),
            });
            continue;
        }
        let ctx = ctx.clone();
        set.spawn(async move { remove_instance(&ctx, plan).await });
    }

    outcomes.extend(set.join_all().await);
    outcomes.sort_by(|a, b| a.key.cmp(&b.key));
    outcomes
}
