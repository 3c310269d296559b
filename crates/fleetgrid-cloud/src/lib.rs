//! fleetgrid-cloud — the cloud provider seam.
//!
//! The engine creates and deletes VMs and persistent disks only through
//! [`CloudProvider`]. [`SimulatedCloud`] keeps every resource in memory and
//! can be told to fail specific operations.

pub mod error;
pub mod provider;
pub mod sim;

pub use error::{CloudError, CloudResult};
pub use provider::{CloudProvider, DiskHandle, VmHandle, VmSpec};
pub use sim::{CloudOp, SimulatedCloud};
