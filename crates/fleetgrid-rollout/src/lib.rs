//! fleetgrid-rollout — driving instances and groups to their desired state.
//!
//! # Components
//!
//! - **`plan`** — what an instance should become and why it needs work
//! - **`instance`** — `InstanceUpdater`, the per-instance state machine
//! - **`job`** — `JobUpdater`, canaries then a bounded-parallel remainder
//! - **`removal`** — deprovisioning instances that are no longer wanted
//! - **`task_set`** — bounded set of spawned tasks

pub mod context;
pub mod error;
pub mod instance;
pub mod job;
pub mod plan;
pub mod removal;
pub mod task_set;

#[cfg(test)]
mod testutil;

pub use context::Collaborators;
pub use error::{UpdateError, UpdateResult};
pub use instance::{InstanceOutcome, InstanceUpdater, next_state};
pub use job::{GroupStatus, JobOutcome, JobUpdater};
pub use plan::{DesiredInstance, GroupPlan, InstanceAction, InstancePlan, needs_update};
pub use removal::{RemovalOutcome, RemovalPlan, TeardownStep, remove_instance, remove_instances};
pub use task_set::ParallelTaskSet;
