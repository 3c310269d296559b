//! Instance updater — the per-instance state machine.
//!
//! A run walks `Detached → Stopping → DetachingResources → Provisioning →
//! AttachingResources → Applying → Starting → Watching → Running`, starting
//! over from `Detached` whatever state the instance rested in. Steps that
//! have nothing to do are no-ops. The first failing step moves the instance
//! to `Failed { step, error }`; completed steps are not rolled back.
//!
//! The working record is only modified after a resource operation has
//! succeeded, or with the partial state a failed disk operation reports, so
//! it always describes what actually exists.

use std::time::Duration;

use fleetgrid_disk::DiskError;
use fleetgrid_state::{InstanceRecord, InstanceState, OrphanedDisk, UpdateStep, VmRecord};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::Collaborators;
use crate::error::{UpdateError, UpdateResult};
use crate::plan::{DesiredInstance, InstanceAction, InstancePlan};

/// Successor of `state` in a successful run.
pub fn next_state(state: &InstanceState) -> UpdateResult<InstanceState> {
    let next = match state {
        InstanceState::Detached => InstanceState::Stopping,
        InstanceState::Stopping => InstanceState::DetachingResources,
        InstanceState::DetachingResources => InstanceState::Provisioning,
        InstanceState::Provisioning => InstanceState::AttachingResources,
        InstanceState::AttachingResources => InstanceState::Applying,
        InstanceState::Applying => InstanceState::Starting,
        InstanceState::Starting => InstanceState::Watching,
        InstanceState::Watching => InstanceState::Running,
        InstanceState::Running | InstanceState::Failed { .. } => {
            return Err(UpdateError::InvalidStateTransition {
                from: state.clone(),
            });
        }
    };
    Ok(next)
}

/// How an instance run ended.
#[derive(Debug)]
pub struct InstanceOutcome {
    /// Final working record; `state` is `Running` or `Failed`.
    pub record: InstanceRecord,
    pub action: InstanceAction,
    pub canary: bool,
    /// States entered, in order.
    pub transitions: Vec<InstanceState>,
    /// Disks that left the instance during the run.
    pub orphaned: Vec<OrphanedDisk>,
    pub error: Option<UpdateError>,
}

impl InstanceOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed_step(&self) -> Option<UpdateStep> {
        match &self.record.state {
            InstanceState::Failed { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Drives one instance through a full update.
pub struct InstanceUpdater {
    ctx: Collaborators,
    desired: DesiredInstance,
    record: InstanceRecord,
    action: InstanceAction,
    watch_time: Duration,
    canary: bool,
    cancel: watch::Receiver<bool>,
    replace_vm: bool,
    orphaned: Vec<OrphanedDisk>,
}

impl InstanceUpdater {
    pub fn new(
        ctx: Collaborators,
        plan: InstancePlan,
        watch_time: Duration,
        canary: bool,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let replace_vm = plan
            .current
            .vm
            .as_ref()
            .is_none_or(|vm| vm.fingerprint != plan.desired.vm_fingerprint);
        Self {
            ctx,
            desired: plan.desired,
            record: plan.current,
            action: plan.action,
            watch_time,
            canary,
            cancel,
            replace_vm,
            orphaned: Vec::new(),
        }
    }

    pub async fn run(mut self) -> InstanceOutcome {
        let name = self.desired.name();
        info!(
            deployment = %self.desired.deployment,
            instance = %name,
            action = ?self.action,
            canary = self.canary,
            "updating instance"
        );

        let mut transitions = Vec::new();
        let mut state = InstanceState::Detached;
        let result = loop {
            state = match next_state(&state) {
                Ok(next) => next,
                Err(e) => break Err((UpdateStep::Watching, e)),
            };
            transitions.push(state.clone());
            self.record.state = state.clone();

            let Some(step) = state.step() else {
                break Ok(());
            };
            if *self.cancel.borrow() {
                break Err((step, UpdateError::Cancelled));
            }
            debug!(instance = %name, %step, "entering step");
            if let Err(e) = self.execute(step).await {
                break Err((step, e));
            }
        };

        let error = match result {
            Ok(()) => {
                self.record.applied_fingerprint = Some(self.desired.spec_fingerprint.clone());
                info!(deployment = %self.desired.deployment, instance = %name, "instance running");
                None
            }
            Err((step, e)) => {
                error!(
                    deployment = %self.desired.deployment,
                    instance = %name,
                    %step,
                    error = %e,
                    "instance update failed"
                );
                let failed = InstanceState::Failed {
                    step,
                    error: e.to_string(),
                };
                transitions.push(failed.clone());
                self.record.state = failed;
                Some(e)
            }
        };
        self.record.updated_at = epoch_secs();

        InstanceOutcome {
            record: self.record,
            action: self.action,
            canary: self.canary,
            transitions,
            orphaned: self.orphaned,
            error,
        }
    }

    async fn execute(&mut self, step: UpdateStep) -> UpdateResult<()> {
        match step {
            UpdateStep::Stopping => self.stop().await,
            UpdateStep::DetachingResources => self.detach_resources().await,
            UpdateStep::Provisioning => self.provision().await,
            UpdateStep::AttachingResources => self.attach_resources().await,
            UpdateStep::Applying => {
                let spec = self.desired.rendered_spec(&self.record);
                let agent = self.agent_id()?;
                Ok(self.ctx.agents.apply(&agent, spec).await?)
            }
            UpdateStep::Starting => {
                let agent = self.agent_id()?;
                Ok(self.ctx.agents.start(&agent).await?)
            }
            UpdateStep::Watching => self.watch().await,
        }
    }

    async fn stop(&mut self) -> UpdateResult<()> {
        let Some(vm) = self.record.vm.as_ref() else {
            return Ok(());
        };
        if let Some(hook) = self.desired.group.drain.as_ref() {
            let wait = self.ctx.agents.drain(&vm.agent_id, hook).await?;
            if !wait.is_zero() {
                debug!(instance = %self.desired.name(), ?wait, "draining");
                tokio::time::sleep(wait).await;
            }
        }
        self.ctx.agents.stop(&vm.agent_id).await?;
        Ok(())
    }

    async fn detach_resources(&mut self) -> UpdateResult<()> {
        if !self.replace_vm {
            return Ok(());
        }
        while let Some(reservation) = self.record.reservations.first().cloned() {
            self.ctx.network.release(&reservation).await?;
            self.record.reservations.remove(0);
        }
        self.record.disk = self
            .ctx
            .disks
            .detach(&self.record)
            .await
            .map_err(|e| self.keep_disk(e))?;
        Ok(())
    }

    async fn provision(&mut self) -> UpdateResult<()> {
        if !self.replace_vm {
            return Ok(());
        }
        if let Some(old) = self.record.vm.as_ref() {
            self.ctx.cloud.delete_vm(&old.cid).await?;
            debug!(instance = %self.desired.name(), vm = %old.cid, "old vm deleted");
            self.record.vm = None;
        }
        let handle = self.ctx.cloud.create_vm(&self.desired.vm_spec()).await?;
        info!(instance = %self.desired.name(), vm = %handle.cid, "vm created");
        self.record.vm = Some(VmRecord {
            cid: handle.cid,
            agent_id: handle.agent_id,
            fingerprint: self.desired.vm_fingerprint.clone(),
        });
        Ok(())
    }

    async fn attach_resources(&mut self) -> UpdateResult<()> {
        let key = self.desired.key();
        let group = self.desired.group.clone();
        for net in &group.networks {
            let requested = group.static_ip(&net.name, self.desired.index);
            let reservation = self
                .ctx
                .network
                .reserve(&key, &net.name, requested)
                .await?;
            self.record.reservations.retain(|r| r.network != net.name);
            self.record.reservations.push(reservation);
        }

        let change = self
            .ctx
            .disks
            .ensure_disk(&self.record, group.persistent_disk.as_ref())
            .await
            .map_err(|e| self.keep_disk(e))?;
        debug!(instance = %self.desired.name(), outcome = ?change.outcome, "disk ensured");
        self.record.disk = change.disk;
        self.orphaned.extend(change.orphaned);
        Ok(())
    }

    /// Fold the disk record a failed disk operation left behind into the
    /// working copy so the persisted record matches the cloud.
    fn keep_disk(&mut self, e: DiskError) -> UpdateError {
        if let Some(disk) = e.disk() {
            warn!(instance = %self.desired.name(), disk = %disk.cid, state = ?disk.state, "keeping partial disk state");
            self.record.disk = Some(disk.clone());
        }
        e.into()
    }

    /// Every poll within the watch window must report the job running.
    async fn watch(&mut self) -> UpdateResult<()> {
        let agent = self.agent_id()?;
        let deadline = Instant::now() + self.watch_time;
        loop {
            let state = self.ctx.agents.get_state(&agent).await?;
            if state != fleetgrid_agent::JOB_RUNNING {
                return Err(UpdateError::Unhealthy { state });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep(self.ctx.watch_poll_interval.min(deadline - now)).await;
        }
    }

    fn agent_id(&self) -> UpdateResult<String> {
        self.record
            .vm
            .as_ref()
            .map(|vm| vm.agent_id.clone())
            .ok_or(UpdateError::NoVm)
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
