//! Scoped variable resolution.
//!
//! Variables are textual `$<scope>.<path>` references. Scopes are tagged
//! (global / session / query / role / Nth-ancestor); the flattened merge
//! exists only for unscoped legacy names and logs when a name is ambiguous
//! across scopes.

use std::collections::BTreeMap;

use tracing::warn;

use trellis_proto::{AttrPath, CollectionId, EntityId, Value, COLLECTION_ATTR};
use trellis_query::Query;

use crate::{
    entity::EntityView,
    schema::{Role, SchemaService},
};

/// The outcome of resolving a filter value: a register value, a list, or
/// nothing at all (an undefined variable never matches a positive operator).
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    One(Value),
    Many(Vec<Value>),
    Undefined,
}

/// One entry on the execution context's ancestor stack: the scalar face of a
/// parent entity, plus any relations already pulled in for variable paths.
#[derive(Debug, Clone)]
pub struct Frame {
    pub entity_id: EntityId,
    pub collection: CollectionId,
    /// Dotted scalar leaf path -> winning value. `None` marks a
    /// schema-declared leaf the entity does not carry (undefined).
    pub values: BTreeMap<String, Option<Value>>,
    /// Relation name -> lazily loaded related frame; `None` records a load
    /// that found nothing.
    pub loaded_relations: BTreeMap<String, Option<Frame>>,
}

impl Frame {
    pub fn value(&self, path: &AttrPath) -> Option<Resolved> {
        self.values.get(&path.to_string()).map(|slot| match slot {
            Some(value) => Resolved::One(value.clone()),
            None => Resolved::Undefined,
        })
    }
}

/// Build an ancestor frame from a materialized entity: every schema-declared
/// scalar leaf (absent ones as undefined), every scalar leaf the entity
/// actually carries, plus `_collection` and the synthesized `id`.
pub fn frame_from_entity(view: &EntityView, schema: &dyn SchemaService) -> Frame {
    let collection = view.collection().map(CollectionId::from).unwrap_or_else(|| view.id().collection_id());
    let mut values: BTreeMap<String, Option<Value>> = BTreeMap::new();

    for path in schema.scalar_attributes(&collection) {
        values.insert(path.to_string(), view.get(&path));
    }
    for (path, leaf) in view.leaves() {
        values.entry(path.to_string()).or_insert_with(|| Some(leaf.value.clone()));
    }
    values.insert("id".to_string(), Some(Value::String(view.id().external_id().to_string())));
    values.insert(COLLECTION_ATTR.to_string(), Some(Value::String(collection.as_str().to_string())));

    Frame { entity_id: view.id().clone(), collection, values, loaded_relations: BTreeMap::new() }
}

/// The ancestor stack shared by reference down the recursive fetch tree.
/// Depth on exit from any fetch must equal depth on entry.
#[derive(Debug, Default)]
pub struct FetchExecutionContext {
    stack: Vec<Frame>,
}

impl FetchExecutionContext {
    pub fn new() -> Self { Self::default() }

    pub fn depth(&self) -> usize { self.stack.len() }

    pub(crate) fn push(&mut self, frame: Frame) { self.stack.push(frame); }

    pub(crate) fn pop(&mut self) { self.stack.pop(); }

    /// The Nth ancestor frame; 1 is the immediate parent. Frame 0 is unused.
    pub fn frame(&self, frames_up: u32) -> Option<&Frame> {
        if frames_up == 0 {
            return None;
        }
        self.stack.len().checked_sub(frames_up as usize).and_then(|idx| self.stack.get(idx))
    }

    pub(crate) fn frame_mut(&mut self, frames_up: u32) -> Option<&mut Frame> {
        if frames_up == 0 {
            return None;
        }
        self.stack.len().checked_sub(frames_up as usize).and_then(move |idx| self.stack.get_mut(idx))
    }

    pub(crate) fn frames_outermost_last(&self) -> impl Iterator<Item = &Frame> { self.stack.iter().rev() }
}

/// Process- and session-level variables available to every query.
#[derive(Debug, Clone, Default)]
pub struct SystemVars {
    pub global: BTreeMap<String, Value>,
    pub session: BTreeMap<String, Value>,
    pub roles: Vec<Role>,
}

impl SystemVars {
    /// Union of role-provided variables; later roles win.
    pub fn role_vars(&self) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        for role in &self.roles {
            merged.extend(role.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

/// Look a dotted path up in a flat variable map: the full dotted name first,
/// falling back to the first segment for single-level names.
pub(crate) fn lookup_in_map(map: &BTreeMap<String, Value>, path: &AttrPath) -> Option<Value> {
    if let Some(value) = map.get(&path.to_string()) {
        return Some(value.clone());
    }
    if path.len() > 1 {
        return map.get(path.first()).cloned();
    }
    None
}

/// Legacy unscoped lookup over the flattened merge, newest wins:
/// query vars, session, roles, globals, then ancestor frames innermost-first.
pub(crate) fn flat_lookup(
    ctx: &FetchExecutionContext,
    system: &SystemVars,
    query: &Query,
    path: &AttrPath,
) -> Resolved {
    let mut hits: Vec<(&'static str, Resolved)> = Vec::new();

    if let Some(value) = lookup_in_map(&query.vars, path) {
        hits.push(("query", Resolved::One(value)));
    }
    if let Some(value) = lookup_in_map(&system.session, path) {
        hits.push(("session", Resolved::One(value)));
    }
    if let Some(value) = lookup_in_map(&system.role_vars(), path) {
        hits.push(("role", Resolved::One(value)));
    }
    if let Some(value) = lookup_in_map(&system.global, path) {
        hits.push(("global", Resolved::One(value)));
    }
    for frame in ctx.frames_outermost_last() {
        if let Some(resolved) = frame.value(path) {
            hits.push(("ancestor", resolved));
            break;
        }
    }

    if hits.len() > 1 {
        let scopes: Vec<&str> = hits.iter().map(|(scope, _)| *scope).collect();
        warn!(target: "trellis::vars", var = %path, ?scopes, "unscoped variable is ambiguous; using newest");
    }
    hits.into_iter().next().map(|(_, resolved)| resolved).unwrap_or(Resolved::Undefined)
}
