#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("create vm for {instance}: {reason}")]
    CreateVm { instance: String, reason: String },

    #[error("delete vm {cid}: {reason}")]
    DeleteVm { cid: String, reason: String },

    #[error("create disk: {0}")]
    CreateDisk(String),

    #[error("attach disk {disk} to {vm}: {reason}")]
    AttachDisk {
        disk: String,
        vm: String,
        reason: String,
    },

    #[error("detach disk {disk} from {vm}: {reason}")]
    DetachDisk {
        disk: String,
        vm: String,
        reason: String,
    },

    #[error("delete disk {cid}: {reason}")]
    DeleteDisk { cid: String, reason: String },
}

pub type CloudResult<T> = Result<T, CloudError>;
