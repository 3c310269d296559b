//! Per-instance and per-group update plans.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_core::{InstanceGroupSpec, ManifestError, UpdatePolicy};
use fleetgrid_cloud::VmSpec;
use fleetgrid_state::{InstanceRecord, InstanceState};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Why an instance is being touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceAction {
    /// No VM yet.
    Create,
    /// Same VM, new spec (or retrying a failed instance).
    Update,
    /// VM-shaping inputs changed; the VM is replaced.
    Recreate,
    /// No longer in the manifest.
    Delete,
}

/// What instance `index` of a group should look like.
#[derive(Debug, Clone)]
pub struct DesiredInstance {
    pub deployment: String,
    pub group: Arc<InstanceGroupSpec>,
    pub index: u32,
    pub vm_fingerprint: String,
    pub spec_fingerprint: String,
}

impl DesiredInstance {
    pub fn new(
        deployment: &str,
        group: Arc<InstanceGroupSpec>,
        index: u32,
    ) -> Result<Self, ManifestError> {
        Ok(Self {
            deployment: deployment.to_string(),
            vm_fingerprint: group.vm_fingerprint(index)?,
            spec_fingerprint: group.spec_fingerprint(index)?,
            group,
            index,
        })
    }

    pub fn key(&self) -> String {
        InstanceRecord::key(&self.deployment, &self.group.name, self.index)
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.group.name, self.index)
    }

    pub fn vm_spec(&self) -> VmSpec {
        VmSpec {
            deployment: self.deployment.clone(),
            instance: self.key(),
            stemcell: self.group.stemcell.clone(),
            vm_type: self.group.vm_type.clone(),
            networks: self.group.networks.iter().map(|n| n.name.clone()).collect(),
        }
    }

    /// The document pushed to the agent on apply.
    pub fn rendered_spec(&self, record: &InstanceRecord) -> Value {
        let networks: BTreeMap<&str, String> = self
            .group
            .networks
            .iter()
            .filter_map(|n| {
                record
                    .reservation(&n.name)
                    .map(|r| (n.name.as_str(), r.address.to_string()))
            })
            .collect();
        json!({
            "deployment": self.deployment,
            "group": self.group.name,
            "index": self.index,
            "release_version": self.group.release_version,
            "properties": self.group.properties,
            "networks": networks,
            "persistent_disk": record.disk.as_ref().map(|d| d.cid.as_str()),
            "fingerprint": self.spec_fingerprint,
        })
    }
}

/// Decide whether `current` has to change to become `desired`.
pub fn needs_update(desired: &DesiredInstance, current: &InstanceRecord) -> Option<InstanceAction> {
    let Some(vm) = current.vm.as_ref() else {
        return Some(InstanceAction::Create);
    };
    if vm.fingerprint != desired.vm_fingerprint {
        return Some(InstanceAction::Recreate);
    }
    if current.state != InstanceState::Running
        || current.applied_fingerprint.as_deref() != Some(desired.spec_fingerprint.as_str())
    {
        return Some(InstanceAction::Update);
    }
    None
}

/// One instance that needs work.
#[derive(Debug, Clone)]
pub struct InstancePlan {
    pub desired: DesiredInstance,
    /// Record as persisted, or a fresh `Detached` one.
    pub current: InstanceRecord,
    pub action: InstanceAction,
}

impl InstancePlan {
    /// Plan `desired` against `current`; `None` when nothing changes.
    pub fn new(desired: DesiredInstance, current: Option<InstanceRecord>) -> Option<Self> {
        let current = current.unwrap_or_else(|| {
            InstanceRecord::new(&desired.deployment, &desired.group.name, desired.index)
        });
        let action = needs_update(&desired, &current)?;
        Some(Self {
            desired,
            current,
            action,
        })
    }
}

/// The instances of one group that need work, ascending by index.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub group: Arc<InstanceGroupSpec>,
    pub policy: UpdatePolicy,
    pub instances: Vec<InstancePlan>,
}

impl GroupPlan {
    pub fn name(&self) -> &str {
        &self.group.name
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
