//! Deployment manifest — the desired topology the engine converges to.
//!
//! Manifests are authored as TOML (or JSON) and validated before a
//! convergence run starts. Per-instance fingerprints derived here decide
//! whether an instance needs an update and whether its VM must be replaced.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;
use crate::fingerprint::fingerprint;
use crate::policy::UpdatePolicy;

/// Desired state of one deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentManifest {
    pub name: String,
    #[serde(default)]
    pub update: UpdatePolicy,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    /// Groups in rollout order.
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroupSpec>,
}

/// An address pool instances can be placed on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NetworkKind,
    pub range: AddressRange,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    /// Addresses may be pinned per instance via `static_ips`.
    Static,
    /// Addresses are always handed out lowest-free-first.
    Dynamic,
}

/// Inclusive IPv4 address range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressRange {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
}

impl AddressRange {
    pub fn new(first: Ipv4Addr, last: Ipv4Addr) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        u32::from(self.first) <= a && a <= u32::from(self.last)
    }

    pub fn is_empty(&self) -> bool {
        u32::from(self.first) > u32::from(self.last)
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            u64::from(u32::from(self.last) - u32::from(self.first)) + 1
        }
    }

    /// Addresses in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (u32::from(self.first)..=u32::from(self.last)).map(Ipv4Addr::from)
    }
}

/// A named set of homogeneous instances ("job").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceGroupSpec {
    pub name: String,
    /// Desired instance count.
    pub instances: u32,
    pub release_version: String,
    pub stemcell: String,
    pub vm_type: String,
    #[serde(default)]
    pub networks: Vec<GroupNetwork>,
    #[serde(default)]
    pub persistent_disk: Option<DiskSpec>,
    #[serde(default)]
    pub disk_retention: DiskRetention,
    #[serde(default)]
    pub drain: Option<DrainHook>,
    /// Overrides the deployment-wide update policy for this group.
    #[serde(default)]
    pub update: Option<UpdatePolicy>,
    /// Rendered job configuration pushed to the agent on apply.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Placement of a group on a network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupNetwork {
    pub name: String,
    /// One address per instance index, static networks only.
    #[serde(default)]
    pub static_ips: Vec<Ipv4Addr>,
}

/// Persistent disk requirements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskSpec {
    pub size_mb: u64,
    #[serde(default = "default_disk_type")]
    pub disk_type: String,
}

fn default_disk_type() -> String {
    "default".to_string()
}

/// What happens to the persistent disk of a removed instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiskRetention {
    /// Keep the disk as an orphan for later reclamation.
    #[default]
    Orphan,
    /// Delete the disk immediately.
    Delete,
}

/// Pre-stop hook run through the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrainHook {
    pub script: String,
    /// Upper bound on how long the instance may drain.
    #[serde(default = "default_drain_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

impl DeploymentManifest {
    /// Load a manifest from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        Ok(manifest)
    }

    pub fn group(&self, name: &str) -> Option<&InstanceGroupSpec> {
        self.instance_groups.iter().find(|g| g.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// The update policy in force for `group`.
    pub fn policy_for(&self, group: &InstanceGroupSpec) -> UpdatePolicy {
        group.update.clone().unwrap_or_else(|| self.update.clone())
    }

    /// Fingerprint of the whole document.
    pub fn fingerprint(&self) -> Result<String, ManifestError> {
        fingerprint(self)
    }

    /// Check structural invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ManifestError> {
        check_name(&self.name)?;
        self.update.validate().map_err(ManifestError::InvalidPolicy)?;

        let mut network_names = HashSet::new();
        for net in &self.networks {
            check_name(&net.name)?;
            if !network_names.insert(net.name.as_str()) {
                return Err(ManifestError::DuplicateNetwork(net.name.clone()));
            }
            if net.range.is_empty() {
                return Err(ManifestError::EmptyRange {
                    network: net.name.clone(),
                    first: net.range.first.to_string(),
                    last: net.range.last.to_string(),
                });
            }
        }

        let mut group_names = HashSet::new();
        let mut static_ips = HashSet::new();
        for group in &self.instance_groups {
            check_name(&group.name)?;
            if !group_names.insert(group.name.as_str()) {
                return Err(ManifestError::DuplicateGroup(group.name.clone()));
            }
            if let Some(policy) = &group.update {
                policy.validate().map_err(ManifestError::InvalidPolicy)?;
            }
            if let Some(disk) = &group.persistent_disk {
                if disk.size_mb == 0 {
                    return Err(ManifestError::EmptyDisk {
                        group: group.name.clone(),
                    });
                }
            }
            for gn in &group.networks {
                let net = self
                    .network(&gn.name)
                    .ok_or_else(|| ManifestError::UnknownNetwork {
                        group: group.name.clone(),
                        network: gn.name.clone(),
                    })?;
                if gn.static_ips.is_empty() {
                    continue;
                }
                if net.kind != NetworkKind::Static {
                    return Err(ManifestError::StaticIpOnDynamicNetwork {
                        group: group.name.clone(),
                        network: gn.name.clone(),
                    });
                }
                if gn.static_ips.len() != group.instances as usize {
                    return Err(ManifestError::StaticIpCount {
                        group: group.name.clone(),
                        network: gn.name.clone(),
                        got: gn.static_ips.len(),
                        want: group.instances,
                    });
                }
                for ip in &gn.static_ips {
                    if !net.range.contains(*ip) {
                        return Err(ManifestError::StaticIpOutOfRange {
                            group: group.name.clone(),
                            network: gn.name.clone(),
                            address: ip.to_string(),
                        });
                    }
                    if !static_ips.insert((gn.name.as_str(), *ip)) {
                        return Err(ManifestError::DuplicateStaticIp {
                            network: gn.name.clone(),
                            address: ip.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), ManifestError> {
    if name.is_empty() || name.contains('/') {
        return Err(ManifestError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Inputs that shape a VM; a change forces the VM to be recreated.
#[derive(Serialize)]
struct VmShape<'a> {
    stemcell: &'a str,
    vm_type: &'a str,
    networks: Vec<(&'a str, Option<Ipv4Addr>)>,
}

/// Everything the agent receives on apply, plus the VM shape.
#[derive(Serialize)]
struct InstanceShape<'a> {
    vm: String,
    release_version: &'a str,
    persistent_disk: Option<&'a DiskSpec>,
    drain: Option<&'a DrainHook>,
    properties: &'a BTreeMap<String, String>,
}

impl InstanceGroupSpec {
    /// The static address pinned for `index` on `network`, if any.
    pub fn static_ip(&self, network: &str, index: u32) -> Option<Ipv4Addr> {
        self.networks
            .iter()
            .find(|n| n.name == network)
            .and_then(|n| n.static_ips.get(index as usize).copied())
    }

    /// Fingerprint of the VM-shaping inputs for instance `index`.
    pub fn vm_fingerprint(&self, index: u32) -> Result<String, ManifestError> {
        fingerprint(&VmShape {
            stemcell: &self.stemcell,
            vm_type: &self.vm_type,
            networks: self
                .networks
                .iter()
                .map(|n| (n.name.as_str(), self.static_ip(&n.name, index)))
                .collect(),
        })
    }

    /// Fingerprint of everything instance `index` should be running.
    pub fn spec_fingerprint(&self, index: u32) -> Result<String, ManifestError> {
        fingerprint(&InstanceShape {
            vm: self.vm_fingerprint(index)?,
            release_version: &self.release_version,
            persistent_disk: self.persistent_disk.as_ref(),
            drain: self.drain.as_ref(),
            properties: &self.properties,
        })
    }
}
