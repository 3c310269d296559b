//! fleet-core — shared types for the fleetgrid convergence engine.
//!
//! - **`manifest`** — the desired-state document (groups, networks, disks)
//! - **`policy`** — rollout policy (canaries, max-in-flight, watch windows)
//! - **`fingerprint`** — stable content hashes used to detect changes
//! - **`config`** — `fleetd.toml` daemon configuration

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod policy;

pub use config::FleetConfig;
pub use error::ManifestError;
pub use manifest::*;
pub use policy::{Quota, UpdatePolicy};
