//! Lock manager error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: String, waited: Duration },

    #[error("lock store error: {0}")]
    Backend(#[from] fleetgrid_state::StateError),
}

pub type LockResult<T> = Result<T, LockError>;
