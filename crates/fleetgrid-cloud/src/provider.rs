//! Cloud provider trait and the values crossing it.

use async_trait::async_trait;
use fleet_core::DiskSpec;
use serde::{Deserialize, Serialize};

use crate::error::CloudResult;

/// What a VM is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub deployment: String,
    /// Instance key (`{deployment}/{group}/{index}`).
    pub instance: String,
    pub stemcell: String,
    pub vm_type: String,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    pub cid: String,
    /// Identity of the agent booted on the VM.
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskHandle {
    pub cid: String,
}

/// Infrastructure operations the engine depends on.
///
/// Deleting a VM or disk the provider no longer knows about succeeds.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_vm(&self, spec: &VmSpec) -> CloudResult<VmHandle>;

    async fn delete_vm(&self, vm_cid: &str) -> CloudResult<()>;

    async fn create_disk(&self, spec: &DiskSpec) -> CloudResult<DiskHandle>;

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;

    async fn delete_disk(&self, disk_cid: &str) -> CloudResult<()>;
}
