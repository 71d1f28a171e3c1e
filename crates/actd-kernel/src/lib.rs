//! Deterministic registration state for the activation daemon: ids, descriptors,
//! the object/group registry, and the journal + snapshot pair it is recovered from.

pub mod activation_log;
pub mod descriptor;
pub mod error;
pub mod ids;
pub mod journal;
pub mod record;
pub mod registry;
pub mod snapshot;
pub mod state;

pub use descriptor::{CommandEnvironment, GroupDescriptor, ObjectDescriptor};
pub use error::KernelError;
pub use ids::{GroupId, IdParseError, ObjectId, SystemId};
pub use activation_log::{ActivationLog, DEFAULT_SNAPSHOT_INTERVAL};
pub use record::LogRecord;
pub use registry::Registry;
pub use snapshot::{FsSnapshotStore, MemSnapshotStore, RegistrySnapshot, SnapshotStore};
pub use state::{GroupRecord, RegistryState};
