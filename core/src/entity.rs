//! Entity materialization: folding an entity's triples into a timestamped
//! view, optionally bounded by a causal frontier.

use std::collections::BTreeMap;

use futures::TryStreamExt;

use trellis_proto::{AttrPath, EntityId, StateVector, Timestamp, Triple, Value};

use crate::{error::RetrievalError, storage::TripleStoreApi};

#[derive(Debug, Clone, PartialEq)]
pub struct LeafState {
    pub value: Value,
    pub timestamp: Timestamp,
}

/// Nested mapping from attribute path to `(value, timestamp)`, last-write-wins
/// per leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    id: EntityId,
    leaves: BTreeMap<AttrPath, LeafState>,
}

impl EntityView {
    pub fn new(id: EntityId) -> Self { Self { id, leaves: BTreeMap::new() } }

    pub fn id(&self) -> &EntityId { &self.id }

    /// Fold one triple in; an older timestamp at an occupied leaf loses.
    pub fn apply(&mut self, triple: &Triple) {
        match self.leaves.get(&triple.attribute) {
            Some(existing) if existing.timestamp >= triple.timestamp => {}
            _ => {
                self.leaves.insert(triple.attribute.clone(), LeafState { value: triple.value.clone(), timestamp: triple.timestamp.clone() });
            }
        }
    }

    pub fn leaf(&self, path: &AttrPath) -> Option<&LeafState> { self.leaves.get(path) }

    /// Winning value at a leaf. `id` resolves to the external id even though
    /// no triple carries it.
    pub fn get(&self, path: &AttrPath) -> Option<Value> {
        if path.len() == 1 && path.first() == "id" {
            return Some(Value::String(self.id.external_id().to_string()));
        }
        self.leaves.get(path).map(|leaf| leaf.value.clone())
    }

    pub fn is_empty(&self) -> bool { self.leaves.is_empty() }

    /// The collection this view currently belongs to, if alive.
    pub fn collection(&self) -> Option<&str> {
        match self.leaves.get(&AttrPath::collection()) {
            Some(LeafState { value: Value::String(name), .. }) => Some(name),
            _ => None,
        }
    }

    /// Tombstoned iff the `_collection` leaf's winning value is null.
    pub fn is_tombstoned(&self) -> bool {
        matches!(self.leaves.get(&AttrPath::collection()), Some(LeafState { value: Value::Null, .. }))
    }

    /// Present members of a set attribute: child leaves whose winning value
    /// is `true`.
    pub fn set_members(&self, path: &AttrPath) -> Vec<&str> {
        self.leaves
            .iter()
            .filter_map(|(leaf_path, state)| {
                let rest = leaf_path.strip_prefix(path)?;
                match (rest, &state.value) {
                    ([member], Value::Bool(true)) => Some(member.as_str()),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn has_member(&self, path: &AttrPath, member: &Value) -> bool {
        let member_path = path.child(member.as_path_segment());
        matches!(self.leaves.get(&member_path), Some(LeafState { value: Value::Bool(true), .. }))
    }

    pub fn leaves(&self) -> impl Iterator<Item = (&AttrPath, &LeafState)> { self.leaves.iter() }
}

/// Fetch and fold every triple recorded for `id`. A `bound` restricts the fold
/// to triples at or below the causal frontier, producing the view "as of"
/// that frontier. Returns the (unbounded-order) raw triples alongside the
/// view for result-triple capture.
pub async fn materialize(
    store: &dyn TripleStoreApi,
    id: &EntityId,
    bound: Option<&StateVector>,
) -> Result<(EntityView, Vec<Triple>), RetrievalError> {
    let mut stream = store.find_by_entity(id).await?;
    let mut view = EntityView::new(id.clone());
    let mut triples = Vec::new();
    while let Some(triple) = stream.try_next().await? {
        if bound.map_or(true, |sv| sv.includes(&triple.timestamp)) {
            view.apply(&triple);
            triples.push(triple);
        }
    }
    Ok((view, triples))
}
