//! Index selection: one access path per query.
//!
//! One index per query is a deliberate simplification - intersection is
//! deferred to filter evaluation, trading occasional over-scan for planner
//! simplicity. Every access path yields entity ids only; candidates are
//! re-materialized so filters see the full causally-consistent entity.

use tracing::debug;

use trellis_proto::{AttrPath, CollectionId, EntityId, Value, COLLECTION_ATTR};
use trellis_query::{Filter, FilterValue, Operator, OrderDirection, Query, Statement};

use crate::{
    error::RetrievalError,
    schema::{relation_at, DataType, SchemaService},
    storage::{RangeQuery, ScanDirection},
};

#[derive(Debug, Clone, PartialEq)]
pub enum AccessPath {
    /// Direct id lookup, no index walk at all.
    IdPoint { entity_id: EntityId },
    /// Attribute-value-entity exact lookup.
    Equality { key: Vec<String>, value: Value },
    /// Attribute range scan bounded by the consumed statements.
    Range { key: Vec<String>, range: RangeQuery },
    /// Attribute index walk in the requested order direction.
    Order { key: Vec<String>, range: RangeQuery },
    /// `_collection -> entity_id` full scan.
    Scan { collection: CollectionId },
}

/// Which query clauses the chosen access path has already satisfied.
///
/// Only causality-safe fulfillments are recorded: the id-point clause (ids
/// are immutable) and a cursor translated into the index walk. AVE-backed
/// equality and range scans may reflect triples beyond the causal frontier,
/// so their clauses still re-evaluate downstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fulfilled {
    pub filters: Vec<usize>,
    pub after: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub access: AccessPath,
    pub fulfilled: Fulfilled,
    /// True when candidates arrive already in the query's requested order.
    pub ordered: bool,
}

fn literal(statement: &Statement) -> Option<&Value> {
    match &statement.value {
        FilterValue::Value(value) => Some(value),
        _ => None,
    }
}

fn top_level_statements(query: &Query) -> impl Iterator<Item = (usize, &Statement)> {
    query.filters.iter().enumerate().filter_map(|(idx, filter)| match filter {
        Filter::Statement(statement) => Some((idx, statement)),
        _ => None,
    })
}

fn index_key(collection: &CollectionId, path: &AttrPath) -> Vec<String> {
    let mut key = Vec::with_capacity(1 + path.len());
    key.push(collection.as_str().to_string());
    key.extend(path.segments().iter().cloned());
    key
}

/// Choose the access path for a prepared query. First rule that fires wins:
/// id point, equality scan, range scan, order scan, full collection scan.
pub fn select_index(query: &Query, schema: &dyn SchemaService, skip_index: bool) -> Result<Plan, RetrievalError> {
    if skip_index {
        return Ok(Plan { access: full_scan(query), fulfilled: Fulfilled::default(), ordered: false });
    }

    // 1. id point
    for (idx, statement) in top_level_statements(query) {
        if statement.op == Operator::Eq && statement.path.len() == 1 && statement.path.first() == "id" {
            if let Some(value) = literal(statement) {
                let entity_id = EntityId::new(&query.collection, &value.as_path_segment());
                debug!(target: "trellis::plan", %entity_id, "id point lookup");
                return Ok(Plan {
                    access: AccessPath::IdPoint { entity_id },
                    fulfilled: Fulfilled { filters: vec![idx], after: false },
                    ordered: false,
                });
            }
        }
    }

    // 2. equality scan
    for (_, statement) in top_level_statements(query) {
        if statement.op != Operator::Eq {
            continue;
        }
        let Some(value) = literal(statement) else { continue };
        match schema.get_attribute(&query.collection, &statement.path) {
            Some(DataType::Record) | Some(DataType::Query(_)) => continue,
            Some(DataType::Set(_)) => {
                // set member lives in the attribute path with a presence value
                let member_path = statement.path.child(value.as_path_segment());
                return Ok(Plan {
                    access: AccessPath::Equality { key: index_key(&query.collection, &member_path), value: Value::Bool(true) },
                    fulfilled: Fulfilled::default(),
                    ordered: false,
                });
            }
            Some(DataType::Scalar(_)) | None => {
                return Ok(Plan {
                    access: AccessPath::Equality { key: index_key(&query.collection, &statement.path), value: value.clone() },
                    fulfilled: Fulfilled::default(),
                    ordered: false,
                });
            }
        }
    }

    // 3. range scan, consuming a complementary-direction pair on the same path
    let statements: Vec<(usize, &Statement)> = top_level_statements(query).collect();
    for (pos, &(_, statement)) in statements.iter().enumerate() {
        if !statement.op.is_range() {
            continue;
        }
        let Some(value) = literal(statement) else { continue };
        if matches!(schema.get_attribute(&query.collection, &statement.path), Some(DataType::Query(_)) | Some(DataType::Record)) {
            continue;
        }
        let mut range = RangeQuery::default();
        apply_range_op(&mut range, statement.op, value.clone());
        for &(_, later) in statements.iter().skip(pos + 1) {
            if later.path == statement.path && later.op.is_complement_of(&statement.op) {
                if let Some(value) = literal(later) {
                    apply_range_op(&mut range, later.op, value.clone());
                    break;
                }
            }
        }
        return Ok(Plan {
            access: AccessPath::Range { key: index_key(&query.collection, &statement.path), range },
            fulfilled: Fulfilled::default(),
            ordered: false,
        });
    }

    // 4. order scan, only for schema-defined paths with no relation hop
    if let Some(primary) = query.order.first() {
        let defined = schema.get_attribute(&query.collection, &primary.path);
        let crosses_relation = relation_at(schema, &query.collection, &primary.path).is_some();
        if matches!(defined, Some(DataType::Scalar(_))) && !crosses_relation {
            let direction = match primary.direction {
                OrderDirection::Asc => ScanDirection::Asc,
                OrderDirection::Desc => ScanDirection::Desc,
            };
            let mut range = RangeQuery::direction(direction);
            let mut fulfilled = Fulfilled::default();
            // a single-key order can absorb the cursor into the walk bound
            if query.order.len() == 1 {
                if let Some(after) = &query.after {
                    match (primary.direction, after.inclusive) {
                        (OrderDirection::Asc, true) => range.gte_cursor = Some(after.cursor.clone()),
                        (OrderDirection::Asc, false) => range.gt_cursor = Some(after.cursor.clone()),
                        (OrderDirection::Desc, true) => range.lte_cursor = Some(after.cursor.clone()),
                        (OrderDirection::Desc, false) => range.lt_cursor = Some(after.cursor.clone()),
                    }
                    fulfilled.after = true;
                }
            }
            return Ok(Plan {
                access: AccessPath::Order { key: index_key(&query.collection, &primary.path), range },
                fulfilled,
                ordered: query.order.len() == 1,
            });
        }
    }

    // 5. full collection scan
    debug!(target: "trellis::plan", collection = %query.collection, "full collection scan");
    Ok(Plan { access: full_scan(query), fulfilled: Fulfilled::default(), ordered: false })
}

fn full_scan(query: &Query) -> AccessPath { AccessPath::Scan { collection: query.collection.clone() } }

fn apply_range_op(range: &mut RangeQuery, op: Operator, value: Value) {
    match op {
        Operator::Gt => range.gt = Some(value),
        Operator::Gte => range.gte = Some(value),
        Operator::Lt => range.lt = Some(value),
        Operator::Lte => range.lte = Some(value),
        _ => {}
    }
}

/// The AVE key of the collection membership index.
pub fn collection_scan_key(collection: &CollectionId) -> Vec<String> { vec![collection.as_str().to_string(), COLLECTION_ATTR.to_string()] }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ScalarType, StaticSchema};
    use trellis_query::{Cardinality, Cursor};

    fn schema() -> StaticSchema {
        let posts = Query::new("posts").statement("author_id", Operator::Eq, FilterValue::Var(trellis_query::VarRef::ancestor(1, "id")));
        StaticSchema::new()
            .with_attr("posts", "rank", DataType::Scalar(ScalarType::Number))
            .with_attr("posts", "title", DataType::Scalar(ScalarType::String))
            .with_attr("posts", "tags", DataType::Set(ScalarType::String))
            .with_relation("users", "posts", posts, Cardinality::Many)
            .with_attr("users", "name", DataType::Scalar(ScalarType::String))
    }

    #[test]
    fn id_point_wins_and_is_fulfilled() {
        let query = Query::new("users").statement("name", Operator::Eq, "Alice").statement("id", Operator::Eq, "1");
        let plan = select_index(&query, &schema(), false).unwrap();
        assert_eq!(plan.access, AccessPath::IdPoint { entity_id: EntityId::try_from("users#1").unwrap() });
        assert_eq!(plan.fulfilled.filters, vec![1]);
    }

    #[test]
    fn equality_scan_keys_scalar_by_path() {
        let query = Query::new("posts").statement("title", Operator::Eq, "hello");
        let plan = select_index(&query, &schema(), false).unwrap();
        assert_eq!(
            plan.access,
            AccessPath::Equality { key: vec!["posts".into(), "title".into()], value: Value::from("hello") }
        );
        // AVE scans are re-evaluated downstream
        assert!(plan.fulfilled.filters.is_empty());
    }

    #[test]
    fn equality_scan_keys_set_by_member() {
        let query = Query::new("posts").statement("tags", Operator::Eq, "rust");
        let plan = select_index(&query, &schema(), false).unwrap();
        assert_eq!(
            plan.access,
            AccessPath::Equality { key: vec!["posts".into(), "tags".into(), "rust".into()], value: Value::Bool(true) }
        );
    }

    #[test]
    fn range_scan_consumes_matching_pair() {
        let query = Query::new("posts")
            .statement("rank", Operator::Gt, 10i64)
            .statement("title", Operator::Eq, FilterValue::Var(trellis_query::VarRef::new(trellis_query::VarScope::Query, "t")))
            .statement("rank", Operator::Lte, 50i64);
        let plan = select_index(&query, &schema(), false).unwrap();
        match plan.access {
            AccessPath::Range { key, range } => {
                assert_eq!(key, vec!["posts".to_string(), "rank".to_string()]);
                assert_eq!(range.gt, Some(Value::I64(10)));
                assert_eq!(range.lte, Some(Value::I64(50)));
            }
            other => panic!("expected range scan, got {:?}", other),
        }
    }

    #[test]
    fn order_scan_translates_single_key_cursor() {
        let cursor = Cursor::new(20i64, EntityId::try_from("posts#2").unwrap());
        let query = Query::new("posts").order_by("rank", OrderDirection::Asc).after(cursor.clone(), false);
        let plan = select_index(&query, &schema(), false).unwrap();
        match &plan.access {
            AccessPath::Order { key, range } => {
                assert_eq!(key, &vec!["posts".to_string(), "rank".to_string()]);
                assert_eq!(range.gt_cursor, Some(cursor));
                assert_eq!(range.direction, ScanDirection::Asc);
            }
            other => panic!("expected order scan, got {:?}", other),
        }
        assert!(plan.fulfilled.after);
        assert!(plan.ordered);
    }

    #[test]
    fn multi_key_order_is_not_order_fulfilled() {
        let query = Query::new("posts").order_by("rank", OrderDirection::Asc).order_by("title", OrderDirection::Asc);
        let plan = select_index(&query, &schema(), false).unwrap();
        assert!(matches!(plan.access, AccessPath::Order { .. }));
        assert!(!plan.ordered);
    }

    #[test]
    fn relation_order_path_falls_through_to_scan() {
        let query = Query::new("users").order_by("posts.rank", OrderDirection::Asc);
        let plan = select_index(&query, &schema(), false).unwrap();
        assert_eq!(plan.access, AccessPath::Scan { collection: "users".into() });
    }

    #[test]
    fn skip_index_forces_scan() {
        let query = Query::new("users").statement("id", Operator::Eq, "1");
        let plan = select_index(&query, &schema(), true).unwrap();
        assert_eq!(plan.access, AccessPath::Scan { collection: "users".into() });
        assert!(plan.fulfilled.filters.is_empty());
    }
}
