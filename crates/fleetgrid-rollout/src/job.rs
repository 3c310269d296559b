//! Job updater — rolls one instance group.
//!
//! Canaries go first, one wave bounded by `max_in_flight` and watched for
//! `canary_watch_time`. If any canary fails the rest of the group is left
//! alone. The remainder then rolls with at most `max_in_flight` instances
//! updating at once; after the first failure no further instance starts,
//! while the ones already in flight finish.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::context::Collaborators;
use crate::instance::{InstanceOutcome, InstanceUpdater};
use crate::plan::{GroupPlan, InstancePlan};
use crate::task_set::ParallelTaskSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Succeeded,
    Failed,
    /// Not attempted because an earlier part of the task failed.
    Skipped,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub group: String,
    pub status: GroupStatus,
    /// Instances that ran, ordered by index.
    pub instances: Vec<InstanceOutcome>,
    /// Instances never started.
    pub skipped: Vec<InstancePlan>,
    pub error: Option<String>,
}

impl JobOutcome {
    /// A group that was not attempted at all.
    pub fn skipped(plan: GroupPlan, reason: &str) -> Self {
        Self {
            group: plan.group.name.clone(),
            status: GroupStatus::Skipped,
            instances: Vec::new(),
            skipped: plan.instances,
            error: Some(reason.to_string()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == GroupStatus::Succeeded
    }
}

pub struct JobUpdater {
    ctx: Collaborators,
    cancel: watch::Receiver<bool>,
}

impl JobUpdater {
    pub fn new(ctx: Collaborators, cancel: watch::Receiver<bool>) -> Self {
        Self { ctx, cancel }
    }

    pub async fn run(&self, plan: GroupPlan) -> JobOutcome {
        let group = plan.group.name.clone();
        if plan.is_empty() {
            info!(group = %group, "group already converged");
            return JobOutcome {
                group,
                status: GroupStatus::Succeeded,
                instances: Vec::new(),
                skipped: Vec::new(),
                error: None,
            };
        }

        let total = plan.group.instances;
        let canaries = (plan.policy.canary_count(total) as usize).min(plan.instances.len());
        let max_in_flight = (plan.policy.max_in_flight_for(total) as usize).max(1);
        info!(
            group = %group,
            instances = plan.instances.len(),
            canaries,
            max_in_flight,
            "updating group"
        );

        let mut pending = plan.instances;
        let rest = pending.split_off(canaries);
        let mut outcomes = Vec::new();
        let mut skipped = Vec::new();

        let (canary_outcomes, canary_skipped) = self
            .wave(pending, max_in_flight, plan.policy.canary_watch_time(), true)
            .await;
        let canaries_ok = canary_skipped.is_empty() && canary_outcomes.iter().all(|o| o.succeeded());
        outcomes.extend(canary_outcomes);
        skipped.extend(canary_skipped);

        if canaries_ok {
            let (rest_outcomes, rest_skipped) = self
                .wave(rest, max_in_flight, plan.policy.update_watch_time(), false)
                .await;
            outcomes.extend(rest_outcomes);
            skipped.extend(rest_skipped);
        } else {
            warn!(group = %group, remaining = rest.len(), "canaries failed, halting group");
            skipped.extend(rest);
        }

        outcomes.sort_by_key(|o| o.record.index);
        skipped.sort_by_key(|p| p.desired.index);

        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(|o| {
                o.error
                    .as_ref()
                    .map(|e| format!("{}: {e}", o.record.name()))
            })
            .collect();
        let (status, error) = if !failures.is_empty() {
            (GroupStatus::Failed, Some(failures.join("; ")))
        } else if !skipped.is_empty() {
            (GroupStatus::Failed, Some("cancelled".to_string()))
        } else {
            (GroupStatus::Succeeded, None)
        };

        match status {
            GroupStatus::Succeeded => info!(group = %group, updated = outcomes.len(), "group updated"),
            _ => warn!(
                group = %group,
                failed = failures.len(),
                skipped = skipped.len(),
                "group update failed"
            ),
        }

        JobOutcome {
            group,
            status,
            instances: outcomes,
            skipped,
            error,
        }
    }

    /// Run `plans` with bounded parallelism. Stops starting new instances
    /// after a failure or on cancellation; returns what ran and what never
    /// started.
    async fn wave(
        &self,
        plans: Vec<InstancePlan>,
        max_in_flight: usize,
        watch_time: Duration,
        canary: bool,
    ) -> (Vec<InstanceOutcome>, Vec<InstancePlan>) {
        let mut set = ParallelTaskSet::new_with_parallelism(max_in_flight);
        let mut outcomes: Vec<InstanceOutcome> = Vec::new();
        let mut queue = plans.into_iter();

        while let Some(plan) = queue.next() {
            outcomes.extend(set.wait_for_slot().await);
            if outcomes.iter().any(|o| !o.succeeded()) || *self.cancel.borrow() {
                let mut skipped = vec![plan];
                skipped.extend(queue);
                outcomes.extend(set.join_all().await);
                return (outcomes, skipped);
            }
            let updater = InstanceUpdater::new(
                self.ctx.clone(),
                plan,
                watch_time,
                canary,
                self.cancel.clone(),
            );
            set.spawn(updater.run());
        }

        outcomes.extend(set.join_all().await);
        (outcomes, Vec::new())
    }
}
