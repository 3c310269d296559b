//! In-process simulated cloud.
//!
//! VMs get cids `vm-<n>` and an agent id of `<instance>#<n>`, so agent
//! faults can be targeted at an instance before its VM exists. Disks get
//! cids `disk-<n>`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::DiskSpec;
use tracing::debug;

use crate::error::{CloudError, CloudResult};
use crate::provider::{CloudProvider, DiskHandle, VmHandle, VmSpec};

/// Operations that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOp {
    CreateVm,
    DeleteVm,
    CreateDisk,
    AttachDisk,
    DetachDisk,
    DeleteDisk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimVm {
    pub spec: VmSpec,
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDisk {
    pub size_mb: u64,
    pub disk_type: String,
    pub attached_to: Option<String>,
}

#[derive(Debug, Default)]
struct SimState {
    serial: u64,
    vms: BTreeMap<String, SimVm>,
    disks: BTreeMap<String, SimDisk>,
    /// Remaining injected failures per op; `None` fails forever.
    failures: HashMap<CloudOp, Option<u32>>,
    calls: HashMap<CloudOp, u32>,
}

impl SimState {
    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    /// Count the call and report whether an injected failure fires.
    fn record(&mut self, op: CloudOp) -> bool {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op) {
            Some(None) => true,
            Some(Some(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Cloud provider keeping VMs and disks in memory.
#[derive(Debug, Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
    latency: Duration,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: CloudOp, times: u32) {
        self.lock().failures.insert(op, Some(times));
    }

    /// Fail every call of `op` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: CloudOp) {
        self.lock().failures.insert(op, None);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Number of times `op` was invoked, including failed calls.
    pub fn calls(&self, op: CloudOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn vms(&self) -> BTreeMap<String, SimVm> {
        self.lock().vms.clone()
    }

    pub fn disks(&self) -> BTreeMap<String, SimDisk> {
        self.lock().disks.clone()
    }

    pub fn disk(&self, cid: &str) -> Option<SimDisk> {
        self.lock().disks.get(cid).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

const INJECTED: &str = "injected failure";

#[async_trait]
impl CloudProvider for SimulatedCloud {
    async fn create_vm(&self, spec: &VmSpec) -> CloudResult<VmHandle> {
        self.delay().await;
        let mut state = self.lock();
        if state.record(CloudOp::CreateVm) {
            return Err(CloudError::CreateVm {
                instance: spec.instance.clone(),
                reason: INJECTED.to_string(),
            });
        }
        let n = state.next_serial();
        let handle = VmHandle {
            cid: format!("vm-{n}"),
            agent_id: format!("{}#{n}", spec.instance),
        };
        state.vms.insert(
            handle.cid.clone(),
            SimVm {
                spec: spec.clone(),
                agent_id: handle.agent_id.clone(),
            },
        );
        debug!(vm = %handle.cid, instance = %spec.instance, "sim vm created");
        Ok(handle)
    }

    async fn delete_vm(&self, vm_cid: &str) -> CloudResult<()> {
        self.delay().await;
        let mut state = self.lock();
        if state.record(CloudOp::DeleteVm) {
            return Err(CloudError::DeleteVm {
                cid: vm_cid.to_string(),
                reason: INJECTED.to_string(),
            });
        }
        state.vms.remove(vm_cid);
        for disk in state.disks.values_mut() {
            if disk.attached_to.as_deref() == Some(vm_cid) {
                disk.attached_to = None;
            }
        }
        debug!(vm = %vm_cid, "sim vm deleted");
        Ok(())
    }

    async fn create_disk(&self, spec: &DiskSpec) -> CloudResult<DiskHandle> {
        self.delay().await;
        let mut state = self.lock();
        if state.record(CloudOp::CreateDisk) {
            return Err(CloudError::CreateDisk(INJECTED.to_string()));
        }
        let cid = format!("disk-{}", state.next_serial());
        state.disks.insert(
            cid.clone(),
            SimDisk {
                size_mb: spec.size_mb,
                disk_type: spec.disk_type.clone(),
                attached_to: None,
            },
        );
        debug!(disk = %cid, size_mb = spec.size_mb, "sim disk created");
        Ok(DiskHandle { cid })
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.delay().await;
        let mut state = self.lock();
        let fail = |reason: &str| CloudError::AttachDisk {
            disk: disk_cid.to_string(),
            vm: vm_cid.to_string(),
            reason: reason.to_string(),
        };
        if state.record(CloudOp::AttachDisk) {
            return Err(fail(INJECTED));
        }
        if !state.vms.contains_key(vm_cid) {
            return Err(fail("no such vm"));
        }
        let disk = state
            .disks
            .get_mut(disk_cid)
            .ok_or_else(|| fail("no such disk"))?;
        if let Some(other) = disk.attached_to.as_deref()
            && other != vm_cid
        {
            return Err(fail(&format!("attached to {other}")));
        }
        disk.attached_to = Some(vm_cid.to_string());
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.delay().await;
        let mut state = self.lock();
        let fail = |reason: &str| CloudError::DetachDisk {
            disk: disk_cid.to_string(),
            vm: vm_cid.to_string(),
            reason: reason.to_string(),
        };
        if state.record(CloudOp::DetachDisk) {
            return Err(fail(INJECTED));
        }
        let disk = state
            .disks
            .get_mut(disk_cid)
            .ok_or_else(|| fail("no such disk"))?;
        if let Some(other) = disk.attached_to.as_deref()
            && other != vm_cid
        {
            return Err(fail(&format!("attached to {other}")));
        }
        disk.attached_to = None;
        Ok(())
    }

    async fn delete_disk(&self, disk_cid: &str) -> CloudResult<()> {
        self.delay().await;
        let mut state = self.lock();
        let fail = |reason: &str| CloudError::DeleteDisk {
            cid: disk_cid.to_string(),
            reason: reason.to_string(),
        };
        if state.record(CloudOp::DeleteDisk) {
            return Err(fail(INJECTED));
        }
        if let Some(disk) = state.disks.get(disk_cid)
            && let Some(vm) = &disk.attached_to
        {
            return Err(fail(&format!("still attached to {vm}")));
        }
        state.disks.remove(disk_cid);
        debug!(disk = %disk_cid, "sim disk deleted");
        Ok(())
    }
}
