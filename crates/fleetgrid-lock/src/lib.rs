//! fleetgrid-lock — mutual exclusion over named resources.
//!
//! A lock is a `(key, owner, expiry)` record inserted atomically into a shared
//! store. The store sits behind [`LockBackend`] so the manager works the same
//! over the redb state store, an in-memory map, or any other store that can do
//! a conditional insert.
//!
//! # Components
//!
//! - **`backend`** — `LockBackend` trait, redb and in-memory implementations
//! - **`manager`** — `LockManager` (acquire with timeout, renewal, release)

pub mod backend;
pub mod error;
pub mod manager;

pub use backend::{LockBackend, MemoryLockBackend};
pub use error::{LockError, LockResult};
pub use manager::{LockHandle, LockManager, deployment_key, network_key};
