//! Convergence engine — one run from manifest to committed state.
//!
//! A run holds `deployment/<name>` for its whole duration, so runs against
//! the same deployment are serialized and unrelated deployments proceed
//! independently. Instance and group failures end up in the report; only
//! manifest, lock and store errors abort the run.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::{DeploymentManifest, FleetConfig};
use fleetgrid_agent::{AgentClient, AgentTransport};
use fleetgrid_cloud::CloudProvider;
use fleetgrid_lock::{LockManager, deployment_key};
use fleetgrid_network::NetworkAllocator;
use fleetgrid_rollout::{
    Collaborators, GroupPlan, JobOutcome, JobUpdater, ParallelTaskSet, RemovalOutcome,
    remove_instances,
};
use fleetgrid_state::{DeploymentCommit, DeploymentRecord, StateStore, TaskStatus};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::ConvergeResult;
use crate::planner::{DeploymentPlan, batches, plan_deployment};
use crate::report::{GroupReport, InstanceReport, TaskReport};

#[derive(Clone)]
pub struct Engine {
    store: StateStore,
    locks: LockManager,
    ctx: Collaborators,
    deployment_lock_timeout: Duration,
}

impl Engine {
    /// Build an engine over prepared collaborators.
    pub fn new(
        store: StateStore,
        locks: LockManager,
        ctx: Collaborators,
        deployment_lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            ctx,
            deployment_lock_timeout,
        }
    }

    /// Wire an engine from daemon configuration, with locks and address
    /// reservations kept in `store`. Engines sharing a store never hand out
    /// the same address.
    pub fn from_config(
        store: StateStore,
        config: &FleetConfig,
        cloud: Arc<dyn CloudProvider>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let locks = LockManager::new(Arc::new(store.clone()))
            .with_expiry(config.locks.expiry())
            .with_poll_interval(config.locks.poll_interval());
        let network = NetworkAllocator::new(
            locks.clone(),
            Arc::new(store.clone()),
            config.locks.network_timeout(),
        );
        let agents = AgentClient::new(transport, config.agent.timeout(), config.agent.retries);
        let ctx = Collaborators::new(cloud, agents, network, config.update.watch_poll_interval());
        Self::new(store, locks, ctx, config.locks.deployment_timeout())
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Drive the deployment toward `manifest`.
    ///
    /// Setting `cancel` stops the run at the next step boundary; the partial
    /// outcome is still committed and reported.
    pub async fn converge(
        &self,
        manifest: &DeploymentManifest,
        cancel: watch::Receiver<bool>,
    ) -> ConvergeResult<TaskReport> {
        manifest.validate()?;
        let lock = self
            .locks
            .acquire_renewing(&deployment_key(&manifest.name), self.deployment_lock_timeout)
            .await?;

        let result = self.run(manifest, cancel).await;

        if let Err(e) = self.locks.release(lock) {
            warn!(deployment = %manifest.name, error = %e, "failed to release deployment lock");
        }
        result
    }

    async fn run(
        &self,
        manifest: &DeploymentManifest,
        cancel: watch::Receiver<bool>,
    ) -> ConvergeResult<TaskReport> {
        let started_at = epoch_secs();
        let fingerprint = manifest.fingerprint()?;
        for network in &manifest.networks {
            self.ctx.network.register(network);
        }

        let previous = self.store.get_deployment(&manifest.name)?;
        let existing = self.store.list_instances(&manifest.name)?;
        let plan = plan_deployment(
            manifest,
            previous.as_ref().and_then(|d| d.manifest.as_ref()),
            existing,
        )?;
        if plan.is_noop() {
            info!(deployment = %manifest.name, "deployment already converged");
        } else {
            info!(
                deployment = %manifest.name,
                %fingerprint,
                removals = plan.removals.len(),
                updates = plan.groups.iter().map(|g| g.instances.len()).sum::<usize>(),
                "converging deployment"
            );
        }
        let DeploymentPlan {
            groups,
            removals,
            unchanged,
        } = plan;

        let removal_outcomes = if removals.is_empty() {
            Vec::new()
        } else {
            let bound = manifest.update.max_in_flight_for(removals.len() as u32) as usize;
            remove_instances(&self.ctx, removals, bound, cancel.clone()).await
        };
        let removals_ok = removal_outcomes.iter().all(RemovalOutcome::succeeded);

        let mut halted = (!removals_ok).then(|| "instance removal failed".to_string());
        let mut jobs = Vec::with_capacity(groups.len());
        for batch in batches(groups) {
            if let Some(reason) = halted.as_deref() {
                jobs.extend(batch.into_iter().map(|g| JobOutcome::skipped(g, reason)));
                continue;
            }
            let outcomes = self.run_batch(batch, &cancel).await;
            if !outcomes.iter().all(JobOutcome::succeeded) {
                halted = Some("an earlier instance group failed".to_string());
            }
            jobs.extend(outcomes);
        }

        let succeeded = removals_ok && jobs.iter().all(JobOutcome::succeeded);
        let status = if succeeded {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };

        let commit = build_commit(
            manifest,
            &fingerprint,
            previous,
            status,
            unchanged,
            &removal_outcomes,
            &jobs,
        );
        self.store.commit_deployment(&commit)?;

        let report = TaskReport {
            deployment: manifest.name.clone(),
            status,
            manifest_fingerprint: fingerprint,
            started_at,
            finished_at: epoch_secs(),
            removals: removal_outcomes.iter().map(InstanceReport::from).collect(),
            groups: jobs.iter().map(GroupReport::from).collect(),
            orphaned_disks: commit.orphaned.iter().map(|d| d.cid.clone()).collect(),
        };
        match status {
            TaskStatus::Succeeded => info!(deployment = %manifest.name, "deployment converged"),
            TaskStatus::Failed => error!(
                deployment = %manifest.name,
                failed_groups = report.groups.iter().filter(|g| g.error.is_some()).count(),
                "deployment task failed"
            ),
        }
        Ok(report)
    }

    /// Run the groups of one batch concurrently, returning outcomes in
    /// batch order.
    async fn run_batch(
        &self,
        batch: Vec<GroupPlan>,
        cancel: &watch::Receiver<bool>,
    ) -> Vec<JobOutcome> {
        let mut set = ParallelTaskSet::new_with_parallelism(batch.len());
        for (position, plan) in batch.into_iter().enumerate() {
            let job = JobUpdater::new(self.ctx.clone(), cancel.clone());
            set.spawn(async move { (position, job.run(plan).await) });
        }
        let mut outcomes = set.join_all().await;
        outcomes.sort_by_key(|(position, _)| *position);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

/// Assemble the transactional write for a finished run.
///
/// Every remaining instance of the deployment is included, since the
/// commit replaces the deployment's reservations wholesale. A failed run
/// keeps the previously converged manifest.
fn build_commit(
    manifest: &DeploymentManifest,
    fingerprint: &str,
    previous: Option<DeploymentRecord>,
    status: TaskStatus,
    unchanged: Vec<fleetgrid_state::InstanceRecord>,
    removals: &[RemovalOutcome],
    jobs: &[JobOutcome],
) -> DeploymentCommit {
    let mut instances = unchanged;
    let mut removed = Vec::new();
    let mut orphaned = Vec::new();

    for outcome in removals {
        orphaned.extend(outcome.orphaned.clone());
        match &outcome.record {
            Some(record) => instances.push(record.clone()),
            None => removed.push(outcome.key.clone()),
        }
    }
    for job in jobs {
        for outcome in &job.instances {
            instances.push(outcome.record.clone());
            orphaned.extend(outcome.orphaned.iter().cloned());
        }
        instances.extend(job.skipped.iter().map(|plan| plan.current.clone()));
    }

    let (converged_manifest, converged_fingerprint) = match status {
        TaskStatus::Succeeded => (Some(manifest.clone()), Some(fingerprint.to_string())),
        TaskStatus::Failed => previous
            .map(|p| (p.manifest, p.manifest_fingerprint))
            .unwrap_or((None, None)),
    };

    DeploymentCommit {
        deployment: DeploymentRecord {
            name: manifest.name.clone(),
            manifest: converged_manifest,
            manifest_fingerprint: converged_fingerprint,
            last_task: status,
            updated_at: epoch_secs(),
        },
        instances,
        removed,
        orphaned,
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
