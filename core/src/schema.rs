//! Read-only schema service consumed by the engine.
//!
//! Schema definition and type coercion live elsewhere; the engine only asks
//! what kind of thing an attribute path is, which read filters a collection
//! imposes, and how a stored value is rendered natively.

use std::collections::BTreeMap;

use trellis_proto::{AttrPath, CollectionId, Value, COLLECTION_ATTR};
use trellis_query::{Cardinality, Filter, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    String,
    Number,
    Boolean,
}

/// A schema-declared relation: a stored sub-query template whose ancestor
/// references (`$1...`) point at the owning entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDef {
    pub query: Query,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Scalar(ScalarType),
    Set(ScalarType),
    Record,
    Query(RelationDef),
}

impl DataType {
    pub fn is_set(&self) -> bool { matches!(self, DataType::Set(_)) }
    pub fn is_relation(&self) -> bool { matches!(self, DataType::Query(_)) }
}

/// Read-permission filters injected into a query by preparation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rules {
    pub read_filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub name: String,
    pub vars: BTreeMap<String, Value>,
}

pub trait SchemaService: Send + Sync {
    fn get_attribute(&self, collection: &CollectionId, path: &AttrPath) -> Option<DataType>;

    fn get_collection_rules(&self, collection: &CollectionId) -> Option<Rules>;

    /// Scalar leaf paths declared for the collection; used to seed ancestor
    /// frames (declared-but-absent leaves resolve as undefined).
    fn scalar_attributes(&self, collection: &CollectionId) -> Vec<AttrPath>;

    fn convert_value_to_native(&self, value: &Value, _data_type: Option<&DataType>) -> serde_json::Value { serde_json::Value::from(value) }

    fn can_cache_query(&self, _query: &Query) -> bool { false }
}

/// The relation a statement or variable path enters at its first segment, if
/// any. Shared lookup used by planning, preparation and variable resolution.
pub fn relation_at(schema: &dyn SchemaService, collection: &CollectionId, path: &AttrPath) -> Option<(AttrPath, RelationDef)> {
    for len in 1..=path.len() {
        let prefix = AttrPath::new(path.segments()[..len].to_vec());
        if let Some(DataType::Query(def)) = schema.get_attribute(collection, &prefix) {
            return Some((prefix, def));
        }
    }
    None
}

/// Static schema built up-front, the engine's default `SchemaService`.
///
/// Every collection implicitly declares a scalar string `id` and the
/// `_collection` marker.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    collections: BTreeMap<String, CollectionSchema>,
}

#[derive(Debug, Clone, Default)]
struct CollectionSchema {
    attributes: BTreeMap<AttrPath, DataType>,
    rules: Option<Rules>,
}

impl StaticSchema {
    pub fn new() -> Self { Self::default() }

    pub fn with_collection(mut self, name: &str) -> Self {
        self.collections.entry(name.to_string()).or_default();
        self
    }

    pub fn with_attr(mut self, collection: &str, path: &str, data_type: DataType) -> Self {
        self.collections.entry(collection.to_string()).or_default().attributes.insert(AttrPath::from(path), data_type);
        self
    }

    pub fn with_relation(mut self, collection: &str, path: &str, query: Query, cardinality: Cardinality) -> Self {
        self.with_attr(collection, path, DataType::Query(RelationDef { query, cardinality }))
    }

    pub fn with_rules(mut self, collection: &str, rules: Rules) -> Self {
        self.collections.entry(collection.to_string()).or_default().rules = Some(rules);
        self
    }
}

impl SchemaService for StaticSchema {
    fn get_attribute(&self, collection: &CollectionId, path: &AttrPath) -> Option<DataType> {
        if path.len() == 1 && (path.first() == "id" || path.first() == COLLECTION_ATTR) {
            return Some(DataType::Scalar(ScalarType::String));
        }
        self.collections.get(collection.as_str())?.attributes.get(path).cloned()
    }

    fn get_collection_rules(&self, collection: &CollectionId) -> Option<Rules> {
        self.collections.get(collection.as_str())?.rules.clone()
    }

    fn scalar_attributes(&self, collection: &CollectionId) -> Vec<AttrPath> {
        let mut out = vec![AttrPath::from("id")];
        if let Some(schema) = self.collections.get(collection.as_str()) {
            for (path, data_type) in &schema.attributes {
                if matches!(data_type, DataType::Scalar(_)) {
                    out.push(path.clone());
                }
            }
        }
        out
    }
}

/// Permissive stand-in used when no schema was supplied: every path is a
/// scalar, nothing is a relation, nothing is cached.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemalessSchema;

impl SchemaService for SchemalessSchema {
    fn get_attribute(&self, _collection: &CollectionId, _path: &AttrPath) -> Option<DataType> { Some(DataType::Scalar(ScalarType::String)) }

    fn get_collection_rules(&self, _collection: &CollectionId) -> Option<Rules> { None }

    fn scalar_attributes(&self, _collection: &CollectionId) -> Vec<AttrPath> { vec![AttrPath::from("id")] }
}
