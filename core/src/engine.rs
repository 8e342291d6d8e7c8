//! The engine handle and its public fetch surface.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use trellis_proto::{EntityId, StateVector, Triple, Value};
use trellis_query::Query;

use crate::{
    cache::QueryCache,
    error::RetrievalError,
    fetch::{FetchSet, FetchedEntity, IncludedValue},
    schema::{DataType, SchemaService},
    storage::TripleStoreApi,
    vars::{FetchExecutionContext, SystemVars},
};

/// Native (timestamp-stripped, schema-coerced) rendering of an entity.
pub type NativeEntity = serde_json::Map<String, serde_json::Value>;

/// Per-call options.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Override the engine's schema service for this call.
    pub schema: Option<Arc<dyn SchemaService>>,
    /// Skip read-permission filter injection.
    pub skip_rules: bool,
    /// Consult a variable-aware sub-query cache.
    pub cache: Option<Arc<dyn QueryCache>>,
    /// Materialize entities as of this causal frontier.
    pub state_vector: Option<StateVector>,
    /// Force a full collection scan regardless of usable indexes.
    pub skip_index: bool,
}

impl FetchOptions {
    pub fn with_state_vector(mut self, state_vector: StateVector) -> Self {
        self.state_vector = Some(state_vector);
        self
    }
}

pub struct FetchResult {
    pub results: IndexMap<EntityId, NativeEntity>,
    pub triples: HashMap<EntityId, Vec<Triple>>,
}

pub struct FetchOneResult {
    pub result: Option<NativeEntity>,
    pub triples: HashMap<EntityId, Vec<Triple>>,
}

/// The collection query engine. Cheap to clone; all state lives behind the
/// shared inner.
#[derive(Clone)]
pub struct Engine(pub(crate) Arc<EngineInner>);

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn TripleStoreApi>,
    pub(crate) schema: Arc<dyn SchemaService>,
    pub(crate) system: SystemVars,
}

impl Engine {
    pub fn new(store: Arc<dyn TripleStoreApi>, schema: Arc<dyn SchemaService>) -> Self {
        Self::with_system_vars(store, schema, SystemVars::default())
    }

    pub fn with_system_vars(store: Arc<dyn TripleStoreApi>, schema: Arc<dyn SchemaService>, system: SystemVars) -> Self {
        Engine(Arc::new(EngineInner { store, schema, system }))
    }

    pub(crate) fn store(&self) -> &dyn TripleStoreApi { self.0.store.as_ref() }

    pub fn system_vars(&self) -> &SystemVars { &self.0.system }

    pub(crate) fn schema_for<'a>(&'a self, options: &'a FetchOptions) -> &'a dyn SchemaService {
        match &options.schema {
            Some(schema) => schema.as_ref(),
            None => self.0.schema.as_ref(),
        }
    }

    /// Run a query once against the current snapshot.
    pub async fn fetch(&self, query: Query, options: FetchOptions) -> Result<FetchResult, RetrievalError> {
        let set = self.fetch_set(query.clone(), &options).await?;
        Ok(self.to_native(set, &query, &options))
    }

    /// Like `fetch`, bounded to a single result.
    pub async fn fetch_one(&self, mut query: Query, options: FetchOptions) -> Result<FetchOneResult, RetrievalError> {
        query.limit = Some(1);
        let FetchResult { results, triples } = self.fetch(query, options).await?;
        Ok(FetchOneResult { result: results.into_iter().next().map(|(_, entity)| entity), triples })
    }

    /// Internal entry that keeps the structured entity views.
    pub(crate) async fn fetch_set(&self, query: Query, options: &FetchOptions) -> Result<FetchSet, RetrievalError> {
        let mut ctx = FetchExecutionContext::new();
        let set = self.fetch_with(&mut ctx, query, options).await?;
        debug_assert_eq!(ctx.depth(), 0, "ancestor stack must drain by the end of a fetch");
        Ok(set)
    }

    pub(crate) fn to_native(&self, set: FetchSet, query: &Query, options: &FetchOptions) -> FetchResult {
        let schema = self.schema_for(options);
        let results = set
            .results
            .into_iter()
            .map(|(id, entity)| {
                let native = entity_to_native(&entity, query.select.as_deref(), schema);
                (id, native)
            })
            .collect();
        FetchResult { results, triples: set.triples }
    }
}

/// Project a fetched entity into its native form: timestamps stripped, nulls
/// omitted, set attributes rendered as arrays, includes nested under their
/// aliases.
pub(crate) fn entity_to_native(
    entity: &FetchedEntity,
    select: Option<&[trellis_proto::AttrPath]>,
    schema: &dyn SchemaService,
) -> NativeEntity {
    let view = &entity.view;
    let collection = view.collection().map(trellis_proto::CollectionId::from).unwrap_or_else(|| view.id().collection_id());

    let mut obj = NativeEntity::new();
    obj.insert("id".to_string(), serde_json::Value::String(view.id().external_id().to_string()));

    let mut sets: IndexMap<trellis_proto::AttrPath, Vec<serde_json::Value>> = IndexMap::new();

    for (path, leaf) in view.leaves() {
        if path.is_collection_attr() || leaf.value.is_null() {
            continue;
        }
        if let Some(selected) = select {
            if !selected.iter().any(|sel| path.starts_with(sel)) {
                continue;
            }
        }
        // set member leaves aggregate under their set attribute
        if path.len() > 1 {
            let prefix = trellis_proto::AttrPath::new(path.segments()[..path.len() - 1].to_vec());
            if matches!(schema.get_attribute(&collection, &prefix), Some(DataType::Set(_))) {
                if leaf.value == Value::Bool(true) {
                    sets.entry(prefix).or_default().push(serde_json::Value::String(path.last().to_string()));
                }
                continue;
            }
        }
        let data_type = schema.get_attribute(&collection, path);
        let native = schema.convert_value_to_native(&leaf.value, data_type.as_ref());
        insert_nested(&mut obj, path.segments(), native);
    }

    for (path, members) in sets {
        insert_nested(&mut obj, path.segments(), serde_json::Value::Array(members));
    }

    for (alias, included) in &entity.includes {
        let value = match included {
            IncludedValue::One(one) => match one {
                Some(inner) => serde_json::Value::Object(entity_to_native(inner, None, schema)),
                None => serde_json::Value::Null,
            },
            IncludedValue::Many(many) => {
                serde_json::Value::Array(many.values().map(|inner| serde_json::Value::Object(entity_to_native(inner, None, schema))).collect())
            }
        };
        obj.insert(alias.clone(), value);
    }

    obj
}

fn insert_nested(obj: &mut NativeEntity, segments: &[String], value: serde_json::Value) {
    if segments.len() == 1 {
        obj.insert(segments[0].clone(), value);
        return;
    }
    let entry = obj.entry(segments[0].clone()).or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(map) = entry {
        insert_nested(map, &segments[1..], value);
    }
}
