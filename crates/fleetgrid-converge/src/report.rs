//! Task report returned by a convergence run.

use fleetgrid_rollout::{
    GroupStatus, InstanceAction, InstanceOutcome, JobOutcome, RemovalOutcome, TeardownStep,
    UpdateError,
};
use fleetgrid_state::{InstanceState, TaskStatus, UpdateStep};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub deployment: String,
    pub status: TaskStatus,
    pub manifest_fingerprint: String,
    pub started_at: u64,
    pub finished_at: u64,
    pub removals: Vec<InstanceReport>,
    pub groups: Vec<GroupReport>,
    /// Disks orphaned by this run.
    pub orphaned_disks: Vec<String>,
}

impl TaskReport {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    pub fn group(&self, name: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// All instance reports, removals first.
    pub fn instances(&self) -> impl Iterator<Item = &InstanceReport> {
        self.removals
            .iter()
            .chain(self.groups.iter().flat_map(|g| g.instances.iter()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub name: String,
    pub status: GroupStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub instances: Vec<InstanceReport>,
}

impl From<&JobOutcome> for GroupReport {
    fn from(outcome: &JobOutcome) -> Self {
        let mut instances: Vec<InstanceReport> =
            outcome.instances.iter().map(InstanceReport::from).collect();
        instances.extend(outcome.skipped.iter().map(|plan| InstanceReport {
            name: plan.desired.name(),
            index: plan.desired.index,
            action: plan.action,
            canary: false,
            started: false,
            state: plan.current.state.clone(),
            failed_step: None,
            error: None,
        }));
        instances.sort_by_key(|i| i.index);
        Self {
            name: outcome.group.clone(),
            status: outcome.status,
            error: outcome.error.clone(),
            instances,
        }
    }
}

/// Where an instance stopped: an update step, or a teardown phase for
/// removed instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailedStep {
    Update(UpdateStep),
    Teardown(TeardownStep),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    /// `group/index`.
    pub name: String,
    pub index: u32,
    pub action: InstanceAction,
    pub canary: bool,
    /// False when the instance was left untouched.
    pub started: bool,
    /// State the instance ended in.
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<FailedStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&InstanceOutcome> for InstanceReport {
    fn from(outcome: &InstanceOutcome) -> Self {
        Self {
            name: outcome.record.name(),
            index: outcome.record.index,
            action: outcome.action,
            canary: outcome.canary,
            started: true,
            state: outcome.record.state.clone(),
            failed_step: outcome.failed_step().map(FailedStep::Update),
            error: outcome.error.as_ref().map(ToString::to_string),
        }
    }
}

impl From<&RemovalOutcome> for InstanceReport {
    fn from(outcome: &RemovalOutcome) -> Self {
        Self {
            name: outcome.name.clone(),
            index: outcome.index,
            action: InstanceAction::Delete,
            canary: false,
            started: !matches!(outcome.error, Some(UpdateError::Cancelled)),
            state: outcome
                .record
                .as_ref()
                .map(|r| r.state.clone())
                .unwrap_or(InstanceState::Detached),
            failed_step: outcome.failed_step.map(FailedStep::Teardown),
            error: outcome.error.as_ref().map(ToString::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_steps_serialize_as_plain_names() {
        let update = serde_json::to_value(FailedStep::Update(UpdateStep::Watching)).unwrap();
        assert_eq!(update, "watching");
        let teardown = serde_json::to_value(FailedStep::Teardown(TeardownStep::DeletingVm)).unwrap();
        assert_eq!(teardown, "deleting_vm");

        let back: FailedStep = serde_json::from_value(teardown).unwrap();
        assert_eq!(back, FailedStep::Teardown(TeardownStep::DeletingVm));
    }
}
