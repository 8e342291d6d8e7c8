//! Root permutation: re-rooting the query tree at a descendant sub-query.
//!
//! A query with sub-query filters forms a tree whose edges carry the
//! ancestor-referencing link statements (`author_id = $1.id`). Delta
//! computation must consider a changed entity on *any* side of any relation,
//! so it evaluates one permutation per tree node: the tree re-rooted at that
//! node, with every edge along the way reversed.

use crate::{
    ast::{Filter, Query, Statement},
    error::ReverseOperatorError,
};

/// All root permutations of the query, original first. The result has one
/// entry per node of the sub-query tree.
pub fn root_permutations(query: &Query) -> Result<Vec<Query>, ReverseOperatorError> {
    let mut out = Vec::new();
    walk(query.clone(), None, &mut out)?;
    tracing::trace!(root = %query.collection, count = out.len(), "computed root permutations");
    Ok(out)
}

fn walk(query: Query, skip_edge: Option<usize>, out: &mut Vec<Query>) -> Result<(), ReverseOperatorError> {
    let edges: Vec<usize> = query.subquery_edges().map(|(idx, _)| idx).collect();
    out.push(query.clone());

    for idx in edges {
        if Some(idx) == skip_edge {
            // the edge we arrived through; re-reversing it would walk back up
            continue;
        }
        let rerooted = reverse_edge(&query, idx)?;
        // the old root was appended as the last filter of the new root
        let arrived_through = rerooted.filters.len() - 1;
        walk(rerooted, Some(arrived_through), out)?;
    }
    Ok(())
}

/// Make the sub-query at filter index `edge` the root. Link statements (the
/// child's ancestor-scoped comparisons) move to the old root with path and
/// variable path swapped and the operator reversed.
fn reverse_edge(parent: &Query, edge: usize) -> Result<Query, ReverseOperatorError> {
    let child = match &parent.filters[edge] {
        Filter::SubqueryExists(sub) => sub.as_ref().clone(),
        _ => unreachable!("edge indices come from subquery_edges"),
    };

    let mut old_root = parent.clone();
    old_root.filters.remove(edge);

    let mut new_root = child;
    let mut kept = Vec::with_capacity(new_root.filters.len());
    for filter in new_root.filters.drain(..) {
        if let Filter::Statement(statement) = &filter {
            if let Some((var, _frames)) = statement.ancestor_link() {
                let mut reversed_var = var.clone();
                reversed_var.path = statement.path.clone();
                old_root.filters.push(Filter::Statement(Statement {
                    path: var.path.clone(),
                    op: statement.op.reverse()?,
                    value: crate::ast::FilterValue::Var(reversed_var),
                }));
                continue;
            }
        }
        kept.push(filter);
    }
    new_root.filters = kept;
    new_root.filters.push(Filter::SubqueryExists(Box::new(old_root)));
    Ok(new_root)
}
