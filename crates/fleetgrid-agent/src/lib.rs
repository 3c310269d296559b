//! fleetgrid-agent — talking to the agent resident on each VM.
//!
//! - **`transport`** — `AgentTransport` trait and `AgentRequest`
//! - **`client`** — `AgentClient`: per-call timeout, retry of timed-out
//!   requests under the same request id, typed helpers
//! - **`sim`** — `SimulatedAgents`, an in-process transport with fault
//!   injection and concurrency accounting

pub mod client;
pub mod error;
pub mod sim;
pub mod transport;

pub use client::{AgentClient, JOB_RUNNING};
pub use error::{AgentError, AgentResult};
pub use sim::{AgentCall, AgentFault, SimulatedAgents};
pub use transport::{AgentRequest, AgentTransport};
