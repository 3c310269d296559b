use fleetgrid_agent::AgentError;
use fleetgrid_cloud::CloudError;
use fleetgrid_state::DiskRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiskError {
    #[error("disk creation failed: {0}")]
    Creation(#[source] CloudError),

    #[error("disk attach failed: {0}")]
    Attach(#[source] CloudError),

    #[error("disk detach failed: {0}")]
    Detach(#[source] CloudError),

    #[error("disk delete failed: {0}")]
    Delete(#[source] CloudError),

    #[error("disk agent operation failed: {0}")]
    Agent(#[from] AgentError),

    #[error("instance {instance} has no vm to attach a disk to")]
    NoVm { instance: String },

    /// Failed after the disk had already changed; `disk` is the record the
    /// instance owns now.
    #[error("{source}")]
    Incomplete {
        disk: Box<DiskRecord>,
        #[source]
        source: Box<DiskError>,
    },
}

impl DiskError {
    /// The instance's disk as left by a failed operation, when it differs
    /// from the record passed in.
    pub fn disk(&self) -> Option<&DiskRecord> {
        match self {
            DiskError::Incomplete { disk, .. } => Some(disk.as_ref()),
            _ => None,
        }
    }

    /// The underlying failure.
    pub fn cause(&self) -> &DiskError {
        match self {
            DiskError::Incomplete { source, .. } => source.cause(),
            other => other,
        }
    }

    pub(crate) fn incomplete(self, disk: DiskRecord) -> Self {
        DiskError::Incomplete {
            disk: Box::new(disk),
            source: Box::new(self),
        }
    }
}

pub type DiskResult<T> = Result<T, DiskError>;
