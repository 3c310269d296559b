//! fleetgrid-converge — the deployment convergence engine.
//!
//! Diffs a desired manifest against persisted state, removes instances that
//! left the manifest, rolls instance groups under their update policy while
//! holding the deployment lock, and commits the outcome in one transaction.
//!
//! # Components
//!
//! - **`planner`** — per-group update plans, removals, group batches
//! - **`engine`** — `Engine::converge`, lock, sequencing and commit
//! - **`report`** — serializable task report

pub mod engine;
pub mod error;
pub mod planner;
pub mod report;

pub use engine::Engine;
pub use error::{ConvergeError, ConvergeResult};
pub use planner::{DeploymentPlan, batches, plan_deployment};
pub use report::{FailedStep, GroupReport, InstanceReport, TaskReport};
