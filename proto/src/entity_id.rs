use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CollectionId, DecodeError};

/// Composite entity identifier: `"<collection>#<external_id>"`.
///
/// The collection prefix is load-bearing - index keys, tombstone checks and
/// delta-triple grouping all partition by it.
#[derive(PartialEq, Eq, Hash, Clone, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(collection: &CollectionId, external_id: &str) -> Self { EntityId(format!("{}#{}", collection.as_str(), external_id)) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn collection(&self) -> &str {
        // constructor and TryFrom both guarantee the separator
        match self.0.find('#') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    pub fn external_id(&self) -> &str {
        match self.0.find('#') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn collection_id(&self) -> CollectionId { CollectionId::from(self.collection()) }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> { write!(f, "{}", self.0) }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String { id.0 }
}

impl TryFrom<&str> for EntityId {
    type Error = DecodeError;
    fn try_from(id: &str) -> Result<Self, Self::Error> {
        match id.find('#') {
            Some(0) => Err(DecodeError::EmptyCollection),
            Some(idx) if idx + 1 == id.len() => Err(DecodeError::EmptyExternalId),
            Some(_) => Ok(EntityId(id.to_string())),
            None => Err(DecodeError::MissingSeparator),
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = DecodeError;
    fn try_from(id: String) -> Result<Self, Self::Error> { Self::try_from(id.as_str()) }
}

impl TryFrom<&String> for EntityId {
    type Error = DecodeError;
    fn try_from(id: &String) -> Result<Self, Self::Error> { Self::try_from(id.as_str()) }
}
