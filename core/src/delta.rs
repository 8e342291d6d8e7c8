//! Delta-triple synthesis: the minimal triple set a remote subscriber needs
//! to reconcile its local result with the server's after a write batch.
//!
//! The changed entity can sit on any side of any relation in the query tree,
//! so every root permutation is tried against it. Each permutation probes the
//! entity's "before" view (materialized below the writers' causal frontier)
//! and its current view, and emits entity plus sub-query triples on an
//! out-to-in transition.

use std::collections::{BTreeMap, HashSet};

use indexmap::IndexMap;
use tracing::debug;

use trellis_proto::{AttrPath, EntityId, StateVector, Timestamp, Triple};
use trellis_query::{permute::root_permutations, Cardinality, Filter, Query};

use crate::{
    engine::{Engine, FetchOptions},
    entity::materialize,
    error::RetrievalError,
    fetch::in_collection,
    vars::FetchExecutionContext,
};

fn emit(out: &mut Vec<Triple>, seen: &mut HashSet<(EntityId, AttrPath, Timestamp)>, triple: &Triple) {
    let key = (triple.entity_id.clone(), triple.attribute.clone(), triple.timestamp.clone());
    if seen.insert(key) {
        out.push(triple.clone());
    }
}

impl Engine {
    /// Compute the delta triples for `query` given freshly written triples.
    pub async fn fetch_delta_triples(
        &self,
        query: Query,
        new_triples: Vec<Triple>,
        options: FetchOptions,
    ) -> Result<Vec<Triple>, RetrievalError> {
        if new_triples.is_empty() {
            return Ok(Vec::new());
        }
        let prepared = self.prepare_query(&query, &options)?;

        let mut changed: IndexMap<EntityId, Vec<Triple>> = IndexMap::new();
        for triple in &new_triples {
            changed.entry(triple.entity_id.clone()).or_default().push(triple.clone());
        }

        // "before" frontier: every known client fully seen, except each
        // writer capped just below its first new tick
        let mut before = StateVector::new();
        for client in self.store().find_all_client_ids().await? {
            before.set(client, u64::MAX);
        }
        let mut first_ticks: BTreeMap<String, u64> = BTreeMap::new();
        for triple in &new_triples {
            let entry = first_ticks.entry(triple.timestamp.client_id.clone()).or_insert(triple.timestamp.tick);
            if triple.timestamp.tick < *entry {
                *entry = triple.timestamp.tick;
            }
        }
        for (client, first_tick) in first_ticks {
            before.set(client, first_tick.saturating_sub(1));
        }
        let before_options = options.clone().with_state_vector(before);

        let permutations = root_permutations(&prepared)?;
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        for (entity_id, entity_new) in &changed {
            let (before_view, _) = materialize(self.store(), entity_id, before_options.state_vector.as_ref()).await?;
            let (after_view, after_triples) = materialize(self.store(), entity_id, options.state_vector.as_ref()).await?;

            for perm in &permutations {
                if perm.collection.as_str() != entity_id.collection() {
                    continue;
                }
                let mut ctx = FetchExecutionContext::new();

                let before_simple =
                    in_collection(&before_view, &perm.collection) && self.entity_matches_simple(&mut ctx, perm, &before_view, &before_options).await?;
                let after_simple =
                    in_collection(&after_view, &perm.collection) && self.entity_matches_simple(&mut ctx, perm, &after_view, &options).await?;
                if !before_simple && !after_simple {
                    continue;
                }

                let before_match =
                    before_simple && self.entity_matches_subqueries(&mut ctx, perm, &before_view, &before_options).await?;
                let (after_subqueries, subquery_triples) = self.eval_subqueries_collecting(&mut ctx, perm, &after_view, &options).await?;
                let after_match = after_simple && after_subqueries;

                if !before_match && after_match {
                    debug!(target: "trellis::delta", %entity_id, root = %perm.collection, "entity entered the result set");
                    for triple in &after_triples {
                        // the incoming batch already carries these
                        if !entity_new.contains(triple) {
                            emit(&mut out, &mut seen, triple);
                        }
                    }
                    for triple in &subquery_triples {
                        emit(&mut out, &mut seen, triple);
                    }
                }

                for triple in entity_new {
                    emit(&mut out, &mut seen, triple);
                }
            }
        }

        Ok(out)
    }

    /// Evaluate the sub-query clauses without short-circuiting, collecting
    /// the triples each sub-query touched.
    async fn eval_subqueries_collecting(
        &self,
        ctx: &mut FetchExecutionContext,
        query: &Query,
        entity: &crate::entity::EntityView,
        options: &FetchOptions,
    ) -> Result<(bool, Vec<Triple>), RetrievalError> {
        let mut all = true;
        let mut collected = Vec::new();
        for filter in query.filters.iter().filter(|f| f.contains_subquery()) {
            if !self.eval_filter_collecting(ctx, query, filter, entity, options, &mut collected).await? {
                all = false;
            }
        }
        Ok((all, collected))
    }

    /// `eval_filter`, except every sub-query reached - including ones nested
    /// inside and/or groups - drains its triples into `collected`. Groups do
    /// not short-circuit here; a skipped branch would hide triples the
    /// subscriber needs.
    fn eval_filter_collecting<'a>(
        &'a self,
        ctx: &'a mut FetchExecutionContext,
        query: &'a Query,
        filter: &'a Filter,
        entity: &'a crate::entity::EntityView,
        options: &'a FetchOptions,
        collected: &'a mut Vec<Triple>,
    ) -> futures::future::BoxFuture<'a, Result<bool, RetrievalError>> {
        Box::pin(async move {
            match filter {
                Filter::SubqueryExists(sub) => {
                    let set = self.run_subquery(ctx, entity, &query.vars, sub, Cardinality::One, options).await?;
                    let exists = !set.results.is_empty();
                    for (_, triples) in set.triples {
                        collected.extend(triples);
                    }
                    Ok(exists)
                }
                Filter::ExistsRelation { .. } => {
                    let expanded = crate::fetch::expand_filter(filter, &query.collection, self.schema_for(options))?;
                    self.eval_filter_collecting(ctx, query, &expanded, entity, options, collected).await
                }
                Filter::And(group) => {
                    let mut pass = true;
                    for inner in group {
                        if !self.eval_filter_collecting(ctx, query, inner, entity, options, collected).await? {
                            pass = false;
                        }
                    }
                    Ok(pass)
                }
                Filter::Or(group) => {
                    let mut pass = false;
                    for inner in group {
                        if self.eval_filter_collecting(ctx, query, inner, entity, options, collected).await? {
                            pass = true;
                        }
                    }
                    Ok(pass)
                }
                other => self.eval_filter(ctx, query, other, entity, options).await,
            }
        })
    }
}
