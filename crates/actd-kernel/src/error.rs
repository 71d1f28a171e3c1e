use thiserror::Error;

use crate::ids::{GroupId, ObjectId};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    #[error("group {0} is already registered")]
    DuplicateGroup(GroupId),
    #[error("object {0} is already registered")]
    DuplicateObject(ObjectId),
    #[error("descriptor for object {object} names group {found} but the object belongs to {expected}")]
    GroupMismatch {
        object: ObjectId,
        expected: GroupId,
        found: GroupId,
    },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("journal error: {0}")]
    Journal(String),
    #[error("snapshot decode error: {0}")]
    SnapshotDecode(String),
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
}

impl From<crate::journal::JournalError> for KernelError {
    fn from(err: crate::journal::JournalError) -> Self {
        KernelError::Journal(err.to_string())
    }
}

impl From<serde_cbor::Error> for KernelError {
    fn from(err: serde_cbor::Error) -> Self {
        KernelError::Encode(err.to_string())
    }
}
