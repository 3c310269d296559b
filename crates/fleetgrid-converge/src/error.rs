use fleet_core::ManifestError;
use fleetgrid_lock::LockError;
use fleetgrid_state::StateError;

/// Errors that stop a convergence run before or after the rollout itself.
/// Instance and group failures are reported in the task report instead.
#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("state store: {0}")]
    State(#[from] StateError),
}

pub type ConvergeResult<T> = Result<T, ConvergeError>;
