use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use trellis_proto::{AttrPath, CollectionId, EntityId, Value};

use crate::{error::ReverseOperatorError, var::VarRef};

/// An immutable query value. Consumed once by `fetch` or installed once into
/// a subscription; every rewrite (variable substitution, include expansion,
/// root permutation) produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: CollectionId,
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub after: Option<After>,
    /// `None` ≡ all non-relation attributes.
    pub select: Option<Vec<AttrPath>>,
    pub include: BTreeMap<String, Include>,
    pub vars: BTreeMap<String, Value>,
}

impl Query {
    pub fn new(collection: impl Into<CollectionId>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            after: None,
            select: None,
            include: BTreeMap::new(),
            vars: BTreeMap::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn statement(self, path: impl Into<AttrPath>, op: Operator, value: impl Into<FilterValue>) -> Self {
        self.filter(Filter::Statement(Statement::new(path, op, value)))
    }

    pub fn order_by(mut self, path: impl Into<AttrPath>, direction: OrderDirection) -> Self {
        self.order.push(OrderBy { path: path.into(), direction });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn after(mut self, cursor: Cursor, inclusive: bool) -> Self {
        self.after = Some(After { cursor, inclusive });
        self
    }

    pub fn include(mut self, alias: impl Into<String>, include: Include) -> Self {
        self.include.insert(alias.into(), include);
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Indices of top-level sub-query filters, the edges of the query tree.
    pub fn subquery_edges(&self) -> impl Iterator<Item = (usize, &Query)> {
        self.filters.iter().enumerate().filter_map(|(idx, filter)| match filter {
            Filter::SubqueryExists(sub) => Some((idx, sub.as_ref())),
            _ => None,
        })
    }

    /// True if any filter node (at any nesting depth) is a sub-query.
    pub fn has_subquery_filter(&self) -> bool { self.filters.iter().any(Filter::contains_subquery) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Statement(Statement),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    /// True iff the inner query (evaluated at cardinality one) has a result.
    SubqueryExists(Box<Query>),
    /// Sugar over `SubqueryExists` on a schema-declared relation; expanded by
    /// query preparation.
    ExistsRelation { path: AttrPath, filters: Vec<Filter> },
    Literal(bool),
}

impl Filter {
    pub fn and(filters: Vec<Filter>) -> Self { Filter::And(filters) }
    pub fn or(filters: Vec<Filter>) -> Self { Filter::Or(filters) }
    pub fn exists(query: Query) -> Self { Filter::SubqueryExists(Box::new(query)) }

    pub fn contains_subquery(&self) -> bool {
        match self {
            Filter::Statement(_) | Filter::Literal(_) => false,
            Filter::And(group) | Filter::Or(group) => group.iter().any(Filter::contains_subquery),
            Filter::SubqueryExists(_) | Filter::ExistsRelation { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub path: AttrPath,
    pub op: Operator,
    pub value: FilterValue,
}

impl Statement {
    pub fn new(path: impl Into<AttrPath>, op: Operator, value: impl Into<FilterValue>) -> Self {
        Self { path: path.into(), op, value: value.into() }
    }

    /// The ancestor-scoped variable this statement links through, if any.
    pub fn ancestor_link(&self) -> Option<(&VarRef, u32)> {
        match &self.value {
            FilterValue::Var(var) => match var.scope {
                crate::var::VarScope::Ancestor(n) => Some((var, n)),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    Value(Value),
    Values(Vec<Value>),
    Var(VarRef),
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self { FilterValue::Value(value) }
}
impl From<&str> for FilterValue {
    fn from(s: &str) -> Self { FilterValue::Value(Value::from(s)) }
}
impl From<i64> for FilterValue {
    fn from(i: i64) -> Self { FilterValue::Value(Value::from(i)) }
}
impl From<f64> for FilterValue {
    fn from(f: f64) -> Self { FilterValue::Value(Value::from(f)) }
}
impl From<bool> for FilterValue {
    fn from(b: bool) -> Self { FilterValue::Value(Value::from(b)) }
}
impl From<Vec<Value>> for FilterValue {
    fn from(values: Vec<Value>) -> Self { FilterValue::Values(values) }
}
impl From<VarRef> for FilterValue {
    fn from(var: VarRef) -> Self { FilterValue::Var(var) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Nin,
    Has,
    NotHas,
    Like,
    NotLike,
    IsDefined,
}

impl Operator {
    pub fn is_range(&self) -> bool { matches!(self, Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte) }

    /// The complementary range direction, used to pair `a > x` with `a < y`.
    pub fn is_complement_of(&self, other: &Operator) -> bool {
        matches!(
            (self, other),
            (Operator::Lt | Operator::Lte, Operator::Gt | Operator::Gte) | (Operator::Gt | Operator::Gte, Operator::Lt | Operator::Lte)
        )
    }

    /// Involution used by relation reversal: `a.x < $1.y` on one side of an
    /// edge becomes `y > $1.x` on the other.
    pub fn reverse(&self) -> Result<Operator, ReverseOperatorError> {
        match self {
            Operator::Eq => Ok(Operator::Eq),
            Operator::Neq => Ok(Operator::Neq),
            Operator::Lt => Ok(Operator::Gt),
            Operator::Lte => Ok(Operator::Gte),
            Operator::Gt => Ok(Operator::Lt),
            Operator::Gte => Ok(Operator::Lte),
            Operator::In => Ok(Operator::Has),
            Operator::Has => Ok(Operator::In),
            Operator::Nin => Ok(Operator::NotHas),
            Operator::NotHas => Ok(Operator::Nin),
            other => Err(ReverseOperatorError(*other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Has => "has",
            Operator::NotHas => "!has",
            Operator::Like => "like",
            Operator::NotLike => "nlike",
            Operator::IsDefined => "isDefined",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub path: AttrPath,
    pub direction: OrderDirection,
}

/// Pagination cursor: the primary order key's value plus the entity id that
/// produced it, enough to restart a walk mid-tie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub value: Value,
    pub entity_id: EntityId,
}

impl Cursor {
    pub fn new(value: impl Into<Value>, entity_id: EntityId) -> Self { Self { value: value.into(), entity_id } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct After {
    pub cursor: Cursor,
    pub inclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Include {
    /// `true` in the wire form: expand to the schema-declared relation.
    SchemaDefault,
    /// `null` in the wire form: the alias itself names the relation.
    Same,
    /// Canonical form after preparation.
    Subquery { query: Box<Query>, cardinality: Cardinality },
}

impl Include {
    pub fn subquery(query: Query, cardinality: Cardinality) -> Self { Include::Subquery { query: Box::new(query), cardinality } }

    pub fn is_canonical(&self) -> bool { matches!(self, Include::Subquery { .. }) }
}
