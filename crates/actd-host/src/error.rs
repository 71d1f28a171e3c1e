use actd_kernel::{GroupId, KernelError, ObjectId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    #[error("activation failed: {reason}")]
    ActivationFailed { reason: String },
    #[error("bad descriptor: {0}")]
    BadDescriptor(String),
    #[error("group creation race: {0}")]
    GroupCreationRace(String),
    #[error("exec denied: {0}")]
    PolicyDenied(String),
    #[error("activation system is shutting down")]
    ShuttingDown,
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("kernel error: {0}")]
    Kernel(KernelError),
}

impl ActivationError {
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        ActivationError::ActivationFailed {
            reason: reason.into(),
        }
    }

    /// Stable identifier used as the control protocol error code.
    pub fn code(&self) -> &'static str {
        match self {
            ActivationError::UnknownObject(_) => "unknown_object",
            ActivationError::UnknownGroup(_) => "unknown_group",
            ActivationError::ActivationFailed { .. } => "activation_failed",
            ActivationError::BadDescriptor(_) => "bad_descriptor",
            ActivationError::GroupCreationRace(_) => "group_creation_race",
            ActivationError::PolicyDenied(_) => "policy_denied",
            ActivationError::ShuttingDown => "shutting_down",
            ActivationError::SnapshotFailed(_) => "snapshot_failed",
            ActivationError::InvalidConfig(_) => "invalid_config",
            ActivationError::Kernel(_) => "kernel_error",
        }
    }
}

impl From<KernelError> for ActivationError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::UnknownObject(id) => ActivationError::UnknownObject(id),
            KernelError::UnknownGroup(id) => ActivationError::UnknownGroup(id),
            KernelError::SnapshotFailed(msg) => ActivationError::SnapshotFailed(msg),
            other => ActivationError::Kernel(other),
        }
    }
}

impl From<crate::policy::PolicyDenied> for ActivationError {
    fn from(err: crate::policy::PolicyDenied) -> Self {
        ActivationError::PolicyDenied(err.0)
    }
}
