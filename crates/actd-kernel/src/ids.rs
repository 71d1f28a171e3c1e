use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identity of one registry instance. Every group id minted by a registry
/// embeds it, which lets the registry reject ids that were minted elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemId(Uuid);

impl SystemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an activation group (one OS process boundary).
///
/// Rendered as `<system>/<group>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId {
    system: SystemId,
    uuid: Uuid,
}

impl GroupId {
    pub(crate) fn mint(system: SystemId) -> Self {
        Self {
            system,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn system(&self) -> SystemId {
        self.system
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.uuid
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system, self.uuid)
    }
}

impl FromStr for GroupId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (system, uuid) = s
            .split_once('/')
            .ok_or_else(|| IdParseError::MissingSeparator(s.to_string()))?;
        Ok(Self {
            system: SystemId(Uuid::parse_str(system)?),
            uuid: Uuid::parse_str(uuid)?,
        })
    }
}

/// Identifier of one activatable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("group id '{0}' must have the form <system>/<group>")]
    MissingSeparator(String),
    #[error("invalid uuid: {0}")]
    Uuid(#[from] uuid::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_display_parses_back() {
        let id = GroupId::mint(SystemId::generate());
        let parsed: GroupId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.system(), id.system());
    }

    #[test]
    fn group_id_requires_separator() {
        let err = "0b3c2f3e-9d7e-4c55-a7f5-0d7c4a4b5e6f"
            .parse::<GroupId>()
            .unwrap_err();
        assert!(matches!(err, IdParseError::MissingSeparator(_)));
    }
}
