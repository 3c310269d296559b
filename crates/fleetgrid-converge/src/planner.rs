//! Diffing a manifest against persisted instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_core::{DeploymentManifest, DiskRetention, ManifestError};
use fleetgrid_rollout::{DesiredInstance, GroupPlan, InstancePlan, RemovalPlan, needs_update};
use fleetgrid_state::InstanceRecord;

/// Everything one run has to do.
#[derive(Debug)]
pub struct DeploymentPlan {
    /// One plan per manifest group, in manifest order. Converged groups
    /// have no instances.
    pub groups: Vec<GroupPlan>,
    /// Instances to deprovision, ordered by key.
    pub removals: Vec<RemovalPlan>,
    /// Records that already match the manifest.
    pub unchanged: Vec<InstanceRecord>,
}

impl DeploymentPlan {
    pub fn is_noop(&self) -> bool {
        self.removals.is_empty() && self.groups.iter().all(|g| g.is_empty())
    }
}

/// Plan `manifest` against the deployment's `existing` records.
///
/// `previous` is the manifest of the last successful run; it supplies disk
/// retention and drain hooks for groups that have since been dropped.
pub fn plan_deployment(
    manifest: &DeploymentManifest,
    previous: Option<&DeploymentManifest>,
    existing: Vec<InstanceRecord>,
) -> Result<DeploymentPlan, ManifestError> {
    let mut by_slot: BTreeMap<(String, u32), InstanceRecord> = existing
        .into_iter()
        .map(|r| ((r.group.clone(), r.index), r))
        .collect();

    let mut groups = Vec::with_capacity(manifest.instance_groups.len());
    let mut unchanged = Vec::new();
    for spec in &manifest.instance_groups {
        let group = Arc::new(spec.clone());
        let mut instances = Vec::new();
        for index in 0..group.instances {
            let desired = DesiredInstance::new(&manifest.name, group.clone(), index)?;
            let current = by_slot.remove(&(group.name.clone(), index));
            if let Some(record) = current.as_ref()
                && needs_update(&desired, record).is_none()
            {
                unchanged.extend(current);
                continue;
            }
            instances.extend(InstancePlan::new(desired, current));
        }
        groups.push(GroupPlan {
            policy: manifest.policy_for(spec),
            group,
            instances,
        });
    }

    let removals = by_slot
        .into_values()
        .map(|record| {
            let spec = manifest
                .group(&record.group)
                .or_else(|| previous.and_then(|p| p.group(&record.group)));
            RemovalPlan {
                retention: spec.map(|g| g.disk_retention).unwrap_or(DiskRetention::Orphan),
                drain: spec.and_then(|g| g.drain.clone()),
                record,
            }
        })
        .collect();

    Ok(DeploymentPlan {
        groups,
        removals,
        unchanged,
    })
}

/// Split groups into batches that run one after another. A serial group
/// runs alone; consecutive non-serial groups share a batch.
pub fn batches(groups: Vec<GroupPlan>) -> Vec<Vec<GroupPlan>> {
    let mut out = Vec::new();
    let mut parallel = Vec::new();
    for group in groups {
        if group.policy.serial {
            if !parallel.is_empty() {
                out.push(std::mem::take(&mut parallel));
            }
            out.push(vec![group]);
        } else {
            parallel.push(group);
        }
    }
    if !parallel.is_empty() {
        out.push(parallel);
    }
    out
}
