//! Persisted records for the fleetgrid state store.
//!
//! These types represent the authoritative state of deployments and their
//! instances between convergence runs. All types are serializable to/from
//! JSON for storage in redb tables.

use std::fmt;
use std::net::Ipv4Addr;

use fleet_core::{DeploymentManifest, DiskSpec};
use serde::{Deserialize, Serialize};

// ── Deployment ─────────────────────────────────────────────────────

/// A deployment as last converged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub name: String,
    /// Manifest of the last successful run.
    pub manifest: Option<DeploymentManifest>,
    /// Fingerprint of `manifest`.
    pub manifest_fingerprint: Option<String>,
    /// Outcome of the most recent run.
    pub last_task: TaskStatus,
    /// Unix timestamp (seconds) of the most recent run.
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

impl DeploymentRecord {
    pub fn table_key(&self) -> String {
        self.name.clone()
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// One member of an instance group, identified by its index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub deployment: String,
    pub group: String,
    pub index: u32,
    pub state: InstanceState,
    /// Spec fingerprint the instance last reached `Running` with.
    pub applied_fingerprint: Option<String>,
    pub vm: Option<VmRecord>,
    pub disk: Option<DiskRecord>,
    pub reservations: Vec<Reservation>,
    /// Unix timestamp (seconds) of the last change.
    pub updated_at: u64,
}

impl InstanceRecord {
    /// A not-yet-provisioned instance.
    pub fn new(deployment: &str, group: &str, index: u32) -> Self {
        Self {
            deployment: deployment.to_string(),
            group: group.to_string(),
            index,
            state: InstanceState::Detached,
            applied_fingerprint: None,
            vm: None,
            disk: None,
            reservations: Vec::new(),
            updated_at: 0,
        }
    }

    /// Build the composite key for the instances table.
    pub fn key(deployment: &str, group: &str, index: u32) -> String {
        format!("{deployment}/{group}/{index}")
    }

    pub fn table_key(&self) -> String {
        Self::key(&self.deployment, &self.group, self.index)
    }

    /// Short `group/index` form for logs and reports.
    pub fn name(&self) -> String {
        format!("{}/{}", self.group, self.index)
    }

    /// The reservation held on `network`, if any.
    pub fn reservation(&self, network: &str) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.network == network)
    }
}

/// Where an instance is in its update cycle.
///
/// An instance at rest is either `Running` (converged), `Detached` (never
/// provisioned) or `Failed` (stopped at the recorded step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceState {
    Detached,
    Stopping,
    DetachingResources,
    Provisioning,
    AttachingResources,
    Applying,
    Starting,
    Watching,
    Running,
    Failed { step: UpdateStep, error: String },
}

impl InstanceState {
    /// The step this state performs, for non-terminal working states.
    pub fn step(&self) -> Option<UpdateStep> {
        match self {
            InstanceState::Stopping => Some(UpdateStep::Stopping),
            InstanceState::DetachingResources => Some(UpdateStep::DetachingResources),
            InstanceState::Provisioning => Some(UpdateStep::Provisioning),
            InstanceState::AttachingResources => Some(UpdateStep::AttachingResources),
            InstanceState::Applying => Some(UpdateStep::Applying),
            InstanceState::Starting => Some(UpdateStep::Starting),
            InstanceState::Watching => Some(UpdateStep::Watching),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Detached => f.write_str("detached"),
            InstanceState::Running => f.write_str("running"),
            InstanceState::Failed { step, .. } => write!(f, "failed at {step}"),
            other => match other.step() {
                Some(step) => write!(f, "{step}"),
                None => f.write_str("unknown"),
            },
        }
    }
}

/// A state-machine step that performs work and can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStep {
    Stopping,
    DetachingResources,
    Provisioning,
    AttachingResources,
    Applying,
    Starting,
    Watching,
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateStep::Stopping => "stopping",
            UpdateStep::DetachingResources => "detaching_resources",
            UpdateStep::Provisioning => "provisioning",
            UpdateStep::AttachingResources => "attaching_resources",
            UpdateStep::Applying => "applying",
            UpdateStep::Starting => "starting",
            UpdateStep::Watching => "watching",
        };
        f.write_str(s)
    }
}

// ── VM ────────────────────────────────────────────────────────────

/// The cloud VM currently bound to an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    /// Cloud identifier.
    pub cid: String,
    /// Identity of the agent running on the VM.
    pub agent_id: String,
    /// VM-shaping fingerprint the VM was created with.
    pub fingerprint: String,
}

// ── Persistent disk ───────────────────────────────────────────────

/// A persistent disk owned by an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskRecord {
    pub cid: String,
    pub size_mb: u64,
    pub disk_type: String,
    pub state: DiskState,
    /// VM the disk is attached to.
    pub attached_to: Option<String>,
}

/// Where a persistent disk is in its lifecycle.
///
/// An instance only ever owns `Attached`, `Detaching` or `Detached` disks.
/// `Detaching` means the agent has unmounted the disk but the cloud still
/// has it attached to `attached_to`. `Orphaned` and `Deleted` are final and
/// describe a disk that has left its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Attached,
    Detaching,
    Detached,
    Orphaned,
    Deleted,
}

impl DiskRecord {
    /// Whether this disk already satisfies `spec`.
    pub fn matches(&self, spec: &DiskSpec) -> bool {
        self.size_mb == spec.size_mb && self.disk_type == spec.disk_type
    }

    /// Attached and mounted on `vm_cid`.
    pub fn is_attached_to(&self, vm_cid: &str) -> bool {
        self.state == DiskState::Attached && self.attached_to.as_deref() == Some(vm_cid)
    }

    /// Still attached to `vm_cid` at the cloud level, mounted or not.
    pub fn is_held_by(&self, vm_cid: &str) -> bool {
        matches!(self.state, DiskState::Attached | DiskState::Detaching)
            && self.attached_to.as_deref() == Some(vm_cid)
    }
}

/// A disk detached from its instance and kept for later reclamation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrphanedDisk {
    pub cid: String,
    pub size_mb: u64,
    pub disk_type: String,
    pub deployment: String,
    /// `group/index` of the former owner.
    pub instance: String,
    /// Unix timestamp (seconds).
    pub orphaned_at: u64,
}

impl OrphanedDisk {
    pub fn table_key(&self) -> String {
        self.cid.clone()
    }
}

// ── Network reservation ───────────────────────────────────────────

/// An address held by one instance on one network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Reservation {
    pub network: String,
    pub address: Ipv4Addr,
    /// Instance key (`{deployment}/{group}/{index}`).
    pub instance: String,
}

impl Reservation {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.network, self.address)
    }
}

// ── Lock ──────────────────────────────────────────────────────────

/// An advisory lock on a named resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    /// Token identifying the holding operation.
    pub owner: String,
    /// Unix timestamp (milliseconds) after which the lock is void.
    pub expires_at_ms: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_serializes_tagged() {
        let json = serde_json::to_string(&InstanceState::Running).unwrap();
        assert_eq!(json, r#"{"state":"running"}"#);

        let failed = InstanceState::Failed {
            step: UpdateStep::Watching,
            error: "flapping".to_string(),
        };
        let json = serde_json::to_string(&failed).unwrap();
        let back: InstanceState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failed);
        assert_eq!(failed.to_string(), "failed at watching");
    }

    #[test]
    fn working_states_map_to_steps() {
        assert_eq!(InstanceState::Applying.step(), Some(UpdateStep::Applying));
        assert_eq!(InstanceState::Detached.step(), None);
    }

    #[test]
    fn disk_matches_spec() {
        let disk = DiskRecord {
            cid: "disk-1".to_string(),
            size_mb: 1024,
            disk_type: "ssd".to_string(),
            state: DiskState::Attached,
            attached_to: Some("vm-1".to_string()),
        };
        assert!(disk.matches(&DiskSpec {
            size_mb: 1024,
            disk_type: "ssd".to_string()
        }));
        assert!(!disk.matches(&DiskSpec {
            size_mb: 2048,
            disk_type: "ssd".to_string()
        }));
        assert!(disk.is_attached_to("vm-1"));
        assert!(!disk.is_attached_to("vm-2"));

        let detaching = DiskRecord {
            state: DiskState::Detaching,
            ..disk
        };
        assert!(!detaching.is_attached_to("vm-1"));
        assert!(detaching.is_held_by("vm-1"));
    }

    #[test]
    fn keys_are_hierarchical() {
        let inst = InstanceRecord::new("cf", "router", 3);
        assert_eq!(inst.table_key(), "cf/router/3");
        assert_eq!(inst.name(), "router/3");

        let r = Reservation {
            network: "private".to_string(),
            address: "10.0.0.5".parse().unwrap(),
            instance: inst.table_key(),
        };
        assert_eq!(r.table_key(), "private/10.0.0.5");
    }
}
