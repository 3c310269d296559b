//! fleetgrid-disk — persistent disk lifecycle.
//!
//! The disk manager pairs cloud operations (create, attach, detach, delete)
//! with agent operations (mount, unmount, data copy). A disk is only
//! considered usable once the agent has mounted it; a migration keeps the
//! old disk authoritative until the data copy is confirmed.

pub mod error;
pub mod manager;

pub use error::{DiskError, DiskResult};
pub use manager::{DiskChange, DiskManager, DiskOutcome, RetiredDisk};
