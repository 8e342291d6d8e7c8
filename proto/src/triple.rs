use serde::{Deserialize, Serialize};

use crate::{AttrPath, EntityId, Timestamp, Value};

/// The unit of state: an immutable, client-timestamped assertion about one
/// attribute of one entity. Later timestamps win per leaf at materialization;
/// the log itself is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub entity_id: EntityId,
    pub attribute: AttrPath,
    pub value: Value,
    pub timestamp: Timestamp,
}

impl Triple {
    pub fn new(entity_id: EntityId, attribute: impl Into<AttrPath>, value: impl Into<Value>, timestamp: impl Into<Timestamp>) -> Self {
        Self { entity_id, attribute: attribute.into(), value: value.into(), timestamp: timestamp.into() }
    }

    /// A `_collection` assertion, the triple that brings an entity into being.
    pub fn collection_marker(entity_id: EntityId, timestamp: impl Into<Timestamp>) -> Self {
        let collection = entity_id.collection().to_string();
        Self { entity_id, attribute: AttrPath::collection(), value: Value::String(collection), timestamp: timestamp.into() }
    }

    /// A `_collection = null` assertion, tombstoning the entity.
    pub fn tombstone(entity_id: EntityId, timestamp: impl Into<Timestamp>) -> Self {
        Self { entity_id, attribute: AttrPath::collection(), value: Value::Null, timestamp: timestamp.into() }
    }

    pub fn is_collection_marker(&self) -> bool { self.attribute.is_collection_attr() }
}

impl std::fmt::Display for Triple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}, {})", self.entity_id, self.attribute, self.value, self.timestamp)
    }
}

/// One source transaction's worth of writes, as delivered to `on_write`
/// subscribers. Inserts are new triple versions; deletes remove exact triples
/// (sync compaction), not logical retractions - those are `Null` inserts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub inserts: Vec<Triple>,
    pub deletes: Vec<Triple>,
}

impl WriteBatch {
    pub fn inserts(inserts: Vec<Triple>) -> Self { Self { inserts, deletes: Vec::new() } }

    pub fn is_empty(&self) -> bool { self.inserts.is_empty() && self.deletes.is_empty() }
}
