//! Filter evaluation against a materialized entity.
//!
//! The where list is a conjunction. Clauses evaluate cheapest-first
//! (boolean literal, scalar equality, range, membership, group, sub-query),
//! short-circuiting on the first failure. Clauses the access path fulfilled
//! are skipped; everything else re-evaluates even when an index "proved" the
//! property, because index entries may reflect out-of-frontier triples.

use futures::future::BoxFuture;

use trellis_proto::Value;
use trellis_query::{Cardinality, Filter, Operator, Query, Statement};

use crate::{
    collation,
    engine::{Engine, FetchOptions},
    entity::EntityView,
    error::RetrievalError,
    schema::DataType,
    vars::{FetchExecutionContext, Resolved},
};

/// Evaluation cost class; lower runs earlier.
fn cost_rank(filter: &Filter) -> u8 {
    match filter {
        Filter::Literal(_) => 0,
        Filter::Statement(statement) => match statement.op {
            Operator::Eq | Operator::Neq => 1,
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => 2,
            _ => 3,
        },
        Filter::And(_) | Filter::Or(_) => 4,
        Filter::SubqueryExists(_) | Filter::ExistsRelation { .. } => 5,
    }
}

/// Clause evaluation order for a query, computed once: indices of the where
/// list sorted cheap-first (stable, so equal-cost clauses keep author order).
pub(crate) fn priority_order(filters: &[Filter]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..filters.len()).collect();
    order.sort_by_key(|&idx| cost_rank(&filters[idx]));
    order
}

impl Engine {
    /// Conjunction over the query's where list, skipping fulfilled clauses.
    pub(crate) async fn entity_matches(
        &self,
        ctx: &mut FetchExecutionContext,
        query: &Query,
        fulfilled: &[usize],
        entity: &EntityView,
        options: &FetchOptions,
    ) -> Result<bool, RetrievalError> {
        for idx in priority_order(&query.filters) {
            if fulfilled.contains(&idx) {
                continue;
            }
            if !self.eval_filter(ctx, query, &query.filters[idx], entity, options).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Conjunction over only the non-sub-query clauses; used by the delta
    /// engine to probe before/after views cheaply.
    pub(crate) async fn entity_matches_simple(
        &self,
        ctx: &mut FetchExecutionContext,
        query: &Query,
        entity: &EntityView,
        options: &FetchOptions,
    ) -> Result<bool, RetrievalError> {
        for idx in priority_order(&query.filters) {
            if query.filters[idx].contains_subquery() {
                continue;
            }
            if !self.eval_filter(ctx, query, &query.filters[idx], entity, options).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Conjunction over only the sub-query clauses.
    pub(crate) async fn entity_matches_subqueries(
        &self,
        ctx: &mut FetchExecutionContext,
        query: &Query,
        entity: &EntityView,
        options: &FetchOptions,
    ) -> Result<bool, RetrievalError> {
        for filter in query.filters.iter().filter(|f| f.contains_subquery()) {
            if !self.eval_filter(ctx, query, filter, entity, options).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn eval_filter<'a>(
        &'a self,
        ctx: &'a mut FetchExecutionContext,
        query: &'a Query,
        filter: &'a Filter,
        entity: &'a EntityView,
        options: &'a FetchOptions,
    ) -> BoxFuture<'a, Result<bool, RetrievalError>> {
        Box::pin(async move {
            match filter {
                Filter::Literal(value) => Ok(*value),
                Filter::And(group) => {
                    for inner in group {
                        if !self.eval_filter(ctx, query, inner, entity, options).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Filter::Or(group) => {
                    for inner in group {
                        if self.eval_filter(ctx, query, inner, entity, options).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Filter::SubqueryExists(sub) => {
                    let set = self.run_subquery(ctx, entity, &query.vars, sub, Cardinality::One, options).await?;
                    Ok(!set.results.is_empty())
                }
                Filter::ExistsRelation { .. } => {
                    // preparation normally expands this; expand here for
                    // filters that arrive unprepared (e.g. nested rules)
                    let expanded = crate::fetch::expand_filter(filter, &query.collection, self.schema_for(options))?;
                    self.eval_filter(ctx, query, &expanded, entity, options).await
                }
                Filter::Statement(statement) => self.eval_statement(ctx, query, statement, entity, options).await,
            }
        })
    }

    async fn eval_statement(
        &self,
        ctx: &mut FetchExecutionContext,
        query: &Query,
        statement: &Statement,
        entity: &EntityView,
        options: &FetchOptions,
    ) -> Result<bool, RetrievalError> {
        let data_type = self.schema_for(options).get_attribute(&query.collection, &statement.path);
        if matches!(data_type, Some(DataType::Record)) {
            return Err(RetrievalError::InvalidSchemaItem {
                path: statement.path.to_string(),
                reason: "a record root is not a comparable value".to_string(),
            });
        }
        let is_set = matches!(data_type, Some(DataType::Set(_)));
        let rhs = self.resolve_filter_value(ctx, query, &statement.value, options).await?;

        if statement.op == Operator::IsDefined {
            let want = match &rhs {
                Resolved::One(Value::Bool(b)) => *b,
                _ => true,
            };
            let defined = match entity.get(&statement.path) {
                Some(value) => !value.is_null(),
                None => is_set && !entity.set_members(&statement.path).is_empty(),
            };
            return Ok(defined == want);
        }

        if is_set {
            return eval_set_statement(entity, statement, &rhs);
        }
        eval_scalar_statement(entity.get(&statement.path), statement, &rhs)
    }
}

/// Membership semantics over a set-typed path.
fn eval_set_statement(entity: &EntityView, statement: &Statement, rhs: &Resolved) -> Result<bool, RetrievalError> {
    let has_one = |value: &Value| entity.has_member(&statement.path, value);
    match statement.op {
        Operator::Eq | Operator::Has => Ok(match rhs {
            Resolved::One(value) => has_one(value),
            Resolved::Many(values) => values.iter().any(has_one),
            Resolved::Undefined => false,
        }),
        Operator::Neq | Operator::NotHas => Ok(match rhs {
            Resolved::One(value) => !has_one(value),
            Resolved::Many(values) => !values.iter().any(has_one),
            Resolved::Undefined => true,
        }),
        Operator::In => Ok(match rhs {
            Resolved::Many(values) => entity.set_members(&statement.path).iter().any(|member| {
                values.iter().any(|value| collation::values_equal(&Value::String(member.to_string()), value))
            }),
            Resolved::One(value) => has_one(value),
            Resolved::Undefined => false,
        }),
        Operator::Nin => Ok(match rhs {
            Resolved::Many(values) => !entity.set_members(&statement.path).iter().any(|member| {
                values.iter().any(|value| collation::values_equal(&Value::String(member.to_string()), value))
            }),
            Resolved::One(value) => !has_one(value),
            Resolved::Undefined => true,
        }),
        op => Err(RetrievalError::InvalidFilter(format!("operator {} is not valid on set attribute {}", op, statement.path))),
    }
}

/// Register semantics over a scalar leaf. An undefined leaf fails every
/// positive operator and satisfies every negated one.
fn eval_scalar_statement(leaf: Option<Value>, statement: &Statement, rhs: &Resolved) -> Result<bool, RetrievalError> {
    use std::cmp::Ordering;

    let one = |rhs: &Resolved| -> Option<Value> {
        match rhs {
            Resolved::One(value) => Some(value.clone()),
            _ => None,
        }
    };

    match statement.op {
        Operator::Eq | Operator::Has => Ok(match (&leaf, one(rhs)) {
            (Some(l), Some(r)) => collation::values_equal(l, &r),
            _ => false,
        }),
        Operator::Neq | Operator::NotHas => Ok(match (&leaf, one(rhs)) {
            (Some(l), Some(r)) => !collation::values_equal(l, &r),
            _ => true,
        }),
        Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => Ok(match (&leaf, one(rhs)) {
            (Some(l), Some(r)) => {
                let cmp = collation::compare(l, &r);
                match statement.op {
                    Operator::Lt => cmp == Ordering::Less,
                    Operator::Lte => cmp != Ordering::Greater,
                    Operator::Gt => cmp == Ordering::Greater,
                    _ => cmp != Ordering::Less,
                }
            }
            _ => false,
        }),
        Operator::In => Ok(match (&leaf, rhs) {
            (Some(l), Resolved::Many(values)) => values.iter().any(|v| collation::values_equal(l, v)),
            (Some(l), Resolved::One(v)) => collation::values_equal(l, v),
            _ => false,
        }),
        Operator::Nin => Ok(match (&leaf, rhs) {
            (Some(l), Resolved::Many(values)) => !values.iter().any(|v| collation::values_equal(l, v)),
            (Some(l), Resolved::One(v)) => !collation::values_equal(l, v),
            _ => true,
        }),
        Operator::Like | Operator::NotLike => {
            let matched = match (&leaf, one(rhs)) {
                (Some(Value::String(text)), Some(Value::String(pattern))) => like_match(&pattern, text),
                _ => false,
            };
            Ok(if statement.op == Operator::Like { matched } else { !matched })
        }
        Operator::IsDefined => unreachable!("handled before dispatch"),
    }
}

/// SQL LIKE: `%` matches any run, `_` one character, backslash escapes.
pub(crate) fn like_match(pattern: &str, text: &str) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Tok {
        AnyRun,
        AnyOne,
        Lit(char),
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => tokens.push(Tok::AnyRun),
            '_' => tokens.push(Tok::AnyOne),
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(Tok::Lit(escaped)),
                None => tokens.push(Tok::Lit('\\')),
            },
            other => tokens.push(Tok::Lit(other)),
        }
    }

    let text: Vec<char> = text.chars().collect();
    // dp[j]: tokens consumed so far can match text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for token in tokens {
        let mut next = vec![false; text.len() + 1];
        match token {
            Tok::AnyRun => {
                let mut reachable = false;
                for j in 0..=text.len() {
                    reachable |= dp[j];
                    next[j] = reachable;
                }
            }
            Tok::AnyOne => {
                for j in 0..text.len() {
                    next[j + 1] = dp[j];
                }
            }
            Tok::Lit(c) => {
                for j in 0..text.len() {
                    next[j + 1] = dp[j] && text[j] == c;
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}
