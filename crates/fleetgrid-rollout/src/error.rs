use fleetgrid_agent::AgentError;
use fleetgrid_cloud::CloudError;
use fleetgrid_disk::DiskError;
use fleetgrid_network::NetworkError;
use fleetgrid_state::InstanceState;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("instance unhealthy: agent reported '{state}'")]
    Unhealthy { state: String },

    #[error("instance has no vm")]
    NoVm,

    #[error("cancelled")]
    Cancelled,

    #[error("invalid state transition from {from}")]
    InvalidStateTransition { from: InstanceState },
}

pub type UpdateResult<T> = Result<T, UpdateError>;
