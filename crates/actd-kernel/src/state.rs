use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::descriptor::{GroupDescriptor, ObjectDescriptor};
use crate::error::KernelError;
use crate::ids::{GroupId, ObjectId, SystemId};

/// Persistent part of a group: what survives a daemon restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub descriptor: GroupDescriptor,
    pub incarnation: u64,
    pub objects: BTreeMap<ObjectId, ObjectDescriptor>,
    pub restart_set: BTreeSet<ObjectId>,
}

impl GroupRecord {
    fn new(descriptor: GroupDescriptor) -> Self {
        Self {
            descriptor,
            incarnation: 0,
            objects: BTreeMap::new(),
            restart_set: BTreeSet::new(),
        }
    }
}

/// Object and group tables. Mutators validate before touching anything, so a
/// returned error always leaves the state unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    system: SystemId,
    groups: BTreeMap<GroupId, GroupRecord>,
    objects: BTreeMap<ObjectId, GroupId>,
}

impl RegistryState {
    pub fn new(system: SystemId) -> Self {
        Self {
            system,
            groups: BTreeMap::new(),
            objects: BTreeMap::new(),
        }
    }

    pub fn system_id(&self) -> SystemId {
        self.system
    }

    /// Resolves the group that owns `id`.
    pub fn lookup_group(&self, id: &ObjectId) -> Result<GroupId, KernelError> {
        self.objects
            .get(id)
            .copied()
            .ok_or(KernelError::UnknownObject(*id))
    }

    /// Resolves a group record, rejecting ids minted by another registry.
    pub fn lookup_group_entry(&self, id: &GroupId) -> Result<&GroupRecord, KernelError> {
        if id.system() != self.system {
            return Err(KernelError::UnknownGroup(*id));
        }
        self.groups.get(id).ok_or(KernelError::UnknownGroup(*id))
    }

    fn group_mut(&mut self, id: &GroupId) -> Result<&mut GroupRecord, KernelError> {
        if id.system() != self.system {
            return Err(KernelError::UnknownGroup(*id));
        }
        self.groups.get_mut(id).ok_or(KernelError::UnknownGroup(*id))
    }

    pub fn object_descriptor(&self, id: &ObjectId) -> Result<&ObjectDescriptor, KernelError> {
        let group = self.lookup_group(id)?;
        self.lookup_group_entry(&group)
            .ok()
            .and_then(|record| record.objects.get(id))
            .ok_or(KernelError::UnknownObject(*id))
    }

    pub fn groups(&self) -> impl Iterator<Item = (&GroupId, &GroupRecord)> {
        self.groups.iter()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Every object across the registry whose descriptor asks for restart.
    pub fn restart_candidates(&self) -> Vec<ObjectId> {
        self.groups
            .values()
            .flat_map(|record| record.restart_set.iter().copied())
            .collect()
    }

    pub(crate) fn insert_group(
        &mut self,
        id: GroupId,
        descriptor: GroupDescriptor,
    ) -> Result<(), KernelError> {
        if id.system() != self.system {
            return Err(KernelError::UnknownGroup(id));
        }
        if self.groups.contains_key(&id) {
            return Err(KernelError::DuplicateGroup(id));
        }
        self.groups.insert(id, GroupRecord::new(descriptor));
        Ok(())
    }

    pub(crate) fn insert_object(
        &mut self,
        id: ObjectId,
        descriptor: ObjectDescriptor,
    ) -> Result<(), KernelError> {
        if self.objects.contains_key(&id) {
            return Err(KernelError::DuplicateObject(id));
        }
        let group = descriptor.group;
        let record = self.group_mut(&group)?;
        if descriptor.restart {
            record.restart_set.insert(id);
        }
        record.objects.insert(id, descriptor);
        self.objects.insert(id, group);
        Ok(())
    }

    pub(crate) fn remove_object(&mut self, id: &ObjectId) -> Result<ObjectDescriptor, KernelError> {
        let group = self.lookup_group(id)?;
        let record = self
            .group_mut(&group)
            .map_err(|_| KernelError::UnknownObject(*id))?;
        let descriptor = record
            .objects
            .remove(id)
            .ok_or(KernelError::UnknownObject(*id))?;
        record.restart_set.remove(id);
        self.objects.remove(id);
        Ok(descriptor)
    }

    /// Removes a group and, with it, every object registered under it.
    pub(crate) fn remove_group(&mut self, id: &GroupId) -> Result<GroupRecord, KernelError> {
        self.lookup_group_entry(id)?;
        let record = self
            .groups
            .remove(id)
            .ok_or(KernelError::UnknownGroup(*id))?;
        for object in record.objects.keys() {
            self.objects.remove(object);
        }
        Ok(record)
    }

    pub(crate) fn replace_object_descriptor(
        &mut self,
        id: &ObjectId,
        descriptor: ObjectDescriptor,
    ) -> Result<ObjectDescriptor, KernelError> {
        let group = self.lookup_group(id)?;
        if descriptor.group != group {
            return Err(KernelError::GroupMismatch {
                object: *id,
                expected: group,
                found: descriptor.group,
            });
        }
        let record = self
            .group_mut(&group)
            .map_err(|_| KernelError::UnknownObject(*id))?;
        let slot = record
            .objects
            .get_mut(id)
            .ok_or(KernelError::UnknownObject(*id))?;
        if descriptor.restart {
            record.restart_set.insert(*id);
        } else {
            record.restart_set.remove(id);
        }
        Ok(std::mem::replace(slot, descriptor))
    }

    pub(crate) fn replace_group_descriptor(
        &mut self,
        id: &GroupId,
        descriptor: GroupDescriptor,
    ) -> Result<GroupDescriptor, KernelError> {
        let record = self.group_mut(id)?;
        Ok(std::mem::replace(&mut record.descriptor, descriptor))
    }

    pub(crate) fn set_incarnation(&mut self, id: &GroupId, incarnation: u64) -> Result<(), KernelError> {
        self.group_mut(id)?.incarnation = incarnation;
        Ok(())
    }
}
