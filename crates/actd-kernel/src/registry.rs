use std::path::Path;

use crate::activation_log::ActivationLog;
use crate::descriptor::{GroupDescriptor, ObjectDescriptor};
use crate::error::KernelError;
use crate::ids::{GroupId, ObjectId, SystemId};
use crate::journal::fs::FsJournal;
use crate::record::LogRecord;
use crate::snapshot::FsSnapshotStore;
use crate::state::{GroupRecord, RegistryState};

/// Registration tables plus the log that makes them durable.
///
/// Every mutation is validated and applied in memory first, then journaled.
/// A mutation that fails validation writes nothing.
pub struct Registry {
    state: RegistryState,
    log: ActivationLog,
}

impl Registry {
    pub fn open(mut log: ActivationLog) -> Result<Self, KernelError> {
        let state = log.recover(|| RegistryState::new(SystemId::generate()))?;
        Ok(Self { state, log })
    }

    /// Opens the registry persisted under `root` (`journal/` and `snapshot/`).
    pub fn open_dir(root: impl AsRef<Path>, snapshot_interval: u64) -> Result<Self, KernelError> {
        let root = root.as_ref();
        let journal = FsJournal::open(root)?;
        let snapshots = FsSnapshotStore::open(root)?;
        let log = ActivationLog::new(Box::new(journal), Box::new(snapshots))
            .with_snapshot_interval(snapshot_interval);
        Self::open(log)
    }

    pub fn system_id(&self) -> SystemId {
        self.state.system_id()
    }

    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    pub fn register_group(&mut self, desc: GroupDescriptor) -> Result<GroupId, KernelError> {
        let id = GroupId::mint(self.state.system_id());
        self.commit(LogRecord::RegisterGroup { id, desc })?;
        Ok(id)
    }

    /// Registers an object under the group named by `desc.group`.
    pub fn register_object(&mut self, desc: ObjectDescriptor) -> Result<ObjectId, KernelError> {
        self.state.lookup_group_entry(&desc.group)?;
        let id = ObjectId::mint();
        self.commit(LogRecord::RegisterObject { id, desc })?;
        Ok(id)
    }

    pub fn unregister_object(&mut self, id: &ObjectId) -> Result<ObjectDescriptor, KernelError> {
        let desc = self.state.object_descriptor(id)?.clone();
        self.commit(LogRecord::UnregisterObject { id: *id })?;
        Ok(desc)
    }

    /// Removes the group and all of its objects; returns what was removed.
    pub fn unregister_group(&mut self, id: &GroupId) -> Result<GroupRecord, KernelError> {
        let record = self.state.lookup_group_entry(id)?.clone();
        self.commit(LogRecord::UnregisterGroup { id: *id })?;
        Ok(record)
    }

    pub fn set_object_descriptor(
        &mut self,
        id: &ObjectId,
        desc: ObjectDescriptor,
    ) -> Result<ObjectDescriptor, KernelError> {
        let old = self.state.object_descriptor(id)?.clone();
        self.commit(LogRecord::UpdateObjectDescriptor { id: *id, desc })?;
        Ok(old)
    }

    pub fn set_group_descriptor(
        &mut self,
        id: &GroupId,
        desc: GroupDescriptor,
    ) -> Result<GroupDescriptor, KernelError> {
        let old = self.state.lookup_group_entry(id)?.descriptor.clone();
        self.commit(LogRecord::UpdateGroupDescriptor { id: *id, desc })?;
        Ok(old)
    }

    pub fn set_incarnation(&mut self, id: &GroupId, incarnation: u64) -> Result<(), KernelError> {
        self.commit(LogRecord::GroupIncarnation {
            id: *id,
            incarnation,
        })
    }

    pub fn lookup_group(&self, id: &ObjectId) -> Result<GroupId, KernelError> {
        self.state.lookup_group(id)
    }

    pub fn group(&self, id: &GroupId) -> Result<&GroupRecord, KernelError> {
        self.state.lookup_group_entry(id)
    }

    pub fn object_descriptor(&self, id: &ObjectId) -> Result<&ObjectDescriptor, KernelError> {
        self.state.object_descriptor(id)
    }

    pub fn restart_candidates(&self) -> Vec<ObjectId> {
        self.state.restart_candidates()
    }

    pub fn snapshot_now(&mut self) -> Result<(), KernelError> {
        self.log.snapshot(&self.state)
    }

    fn commit(&mut self, record: LogRecord) -> Result<(), KernelError> {
        record.apply(&mut self.state)?;
        self.log.append(&record, &self.state)
    }
}
