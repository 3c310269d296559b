//! fleetgrid-state — persisted deployment state.
//!
//! Backed by [redb](https://docs.rs/redb). Holds deployments, instances (with
//! their VM and persistent disk), network reservations, orphaned disks and
//! advisory locks.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Instance keys (`{deployment}/{group}/{index}`) make a deployment's rows a
//! prefix scan. A convergence run writes everything it changed through
//! [`StateStore::commit_deployment`] in a single write transaction, so
//! readers never observe a half-applied run.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{DeploymentCommit, StateStore};
pub use types::*;
