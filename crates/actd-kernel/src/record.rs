use serde::{Deserialize, Serialize};

use crate::descriptor::{GroupDescriptor, ObjectDescriptor};
use crate::error::KernelError;
use crate::ids::{GroupId, ObjectId};
use crate::journal::JournalKind;
use crate::state::RegistryState;

/// One registry mutation as it is written to the journal. Recovery replays
/// these through [`LogRecord::apply`], the same path live updates take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record_kind", rename_all = "snake_case")]
pub enum LogRecord {
    RegisterGroup {
        id: GroupId,
        desc: GroupDescriptor,
    },
    UnregisterGroup {
        id: GroupId,
    },
    UpdateGroupDescriptor {
        id: GroupId,
        desc: GroupDescriptor,
    },
    GroupIncarnation {
        id: GroupId,
        incarnation: u64,
    },
    RegisterObject {
        id: ObjectId,
        desc: ObjectDescriptor,
    },
    UnregisterObject {
        id: ObjectId,
    },
    UpdateObjectDescriptor {
        id: ObjectId,
        desc: ObjectDescriptor,
    },
}

impl LogRecord {
    pub fn kind(&self) -> JournalKind {
        match self {
            LogRecord::RegisterGroup { .. } => JournalKind::RegisterGroup,
            LogRecord::UnregisterGroup { .. } => JournalKind::UnregisterGroup,
            LogRecord::UpdateGroupDescriptor { .. } => JournalKind::UpdateGroupDescriptor,
            LogRecord::GroupIncarnation { .. } => JournalKind::GroupIncarnation,
            LogRecord::RegisterObject { .. } => JournalKind::RegisterObject,
            LogRecord::UnregisterObject { .. } => JournalKind::UnregisterObject,
            LogRecord::UpdateObjectDescriptor { .. } => JournalKind::UpdateObjectDescriptor,
        }
    }

    pub fn apply(&self, state: &mut RegistryState) -> Result<(), KernelError> {
        match self {
            LogRecord::RegisterGroup { id, desc } => state.insert_group(*id, desc.clone()),
            LogRecord::UnregisterGroup { id } => state.remove_group(id).map(|_| ()),
            LogRecord::UpdateGroupDescriptor { id, desc } => {
                state.replace_group_descriptor(id, desc.clone()).map(|_| ())
            }
            LogRecord::GroupIncarnation { id, incarnation } => {
                state.set_incarnation(id, *incarnation)
            }
            LogRecord::RegisterObject { id, desc } => state.insert_object(*id, desc.clone()),
            LogRecord::UnregisterObject { id } => state.remove_object(id).map(|_| ()),
            LogRecord::UpdateObjectDescriptor { id, desc } => {
                state.replace_object_descriptor(id, desc.clone()).map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SystemId;

    #[test]
    fn records_are_tagged_by_kind() {
        let system = SystemId::generate();
        let record = LogRecord::UnregisterGroup {
            id: GroupId::mint(system),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["record_kind"], "unregister_group");
        assert_eq!(record.kind(), JournalKind::UnregisterGroup);
    }

    #[test]
    fn cbor_payload_decodes_back_to_record() {
        let system = SystemId::generate();
        let group = GroupId::mint(system);
        let record = LogRecord::RegisterObject {
            id: ObjectId::mint(),
            desc: ObjectDescriptor::new(group, "Echo").with_data(vec![1, 2, 3]),
        };
        let bytes = actd_cbor::to_canonical_cbor(&record).unwrap();
        let decoded: LogRecord = actd_cbor::from_cbor(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn replaying_against_missing_group_fails_without_side_effects() {
        let mut state = RegistryState::new(SystemId::generate());
        let ghost = GroupId::mint(state.system_id());
        let record = LogRecord::RegisterObject {
            id: ObjectId::mint(),
            desc: ObjectDescriptor::new(ghost, "Echo"),
        };
        assert!(matches!(
            record.apply(&mut state),
            Err(KernelError::UnknownGroup(_))
        ));
        assert_eq!(state.object_count(), 0);
    }
}
