//! The recursive fetch pipeline: preparation, access-path selection,
//! candidate streaming, filtering, sort/cursor/limit, includes.
//!
//! Sub-queries re-enter `fetch_with` with an ancestor frame pushed for the
//! parent entity; the frame pop happens on every exit path. Stack depth on
//! exit from any fetch equals the depth on entry.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::future::BoxFuture;
use futures::TryStreamExt;
use indexmap::IndexMap;

use trellis_proto::{AttrPath, CollectionId, EntityId, Triple, Value};
use trellis_query::{Cardinality, Filter, FilterValue, Include, Query, Statement, VarRef, VarScope};

use crate::{
    candidates::candidate_stream,
    engine::{Engine, FetchOptions},
    entity::{materialize, EntityView},
    error::RetrievalError,
    plan::select_index,
    schema::{relation_at, DataType, RelationDef, SchemaService},
    sort::{sort_by_order, AfterGate},
    vars::{flat_lookup, frame_from_entity, lookup_in_map, FetchExecutionContext, Frame, Resolved},
};

/// A fetched entity with its resolved includes, still in view form.
#[derive(Debug, Clone)]
pub struct FetchedEntity {
    pub view: EntityView,
    pub includes: BTreeMap<String, IncludedValue>,
}

#[derive(Debug, Clone)]
pub enum IncludedValue {
    One(Option<Box<FetchedEntity>>),
    Many(IndexMap<EntityId, FetchedEntity>),
}

/// `{results, triples}` as produced by the pipeline, before native
/// projection.
#[derive(Debug, Clone, Default)]
pub struct FetchSet {
    pub results: IndexMap<EntityId, FetchedEntity>,
    pub triples: HashMap<EntityId, Vec<Triple>>,
}

/// True when the view is a live member of the collection. Entities without a
/// `_collection` marker fall back to their id prefix.
pub(crate) fn in_collection(view: &EntityView, collection: &CollectionId) -> bool {
    if view.is_empty() || view.is_tombstoned() {
        return false;
    }
    match view.collection() {
        Some(name) => name == collection.as_str(),
        None => view.id().collection() == collection.as_str(),
    }
}

impl Engine {
    /// Canonicalize a query: expand include shorthands and relation-crossing
    /// statements, inject read-permission filters.
    pub fn prepare_query(&self, query: &Query, options: &FetchOptions) -> Result<Query, RetrievalError> {
        let schema = self.schema_for(options);
        let mut prepared = query.clone();

        let mut include = BTreeMap::new();
        for (alias, spec) in &query.include {
            let canonical = match spec {
                Include::Subquery { .. } => spec.clone(),
                Include::SchemaDefault | Include::Same => {
                    let path = AttrPath::from(alias.as_str());
                    match schema.get_attribute(&query.collection, &path) {
                        Some(DataType::Query(def)) => Include::subquery(def.query, def.cardinality),
                        _ => {
                            return Err(RetrievalError::UnknownRelation {
                                collection: query.collection.to_string(),
                                path: alias.clone(),
                            })
                        }
                    }
                }
            };
            include.insert(alias.clone(), canonical);
        }
        prepared.include = include;

        prepared.filters =
            query.filters.iter().map(|filter| expand_filter(filter, &query.collection, schema)).collect::<Result<Vec<_>, _>>()?;

        if !options.skip_rules {
            if let Some(rules) = schema.get_collection_rules(&query.collection) {
                for filter in rules.read_filters {
                    let expanded = expand_filter(&filter, &query.collection, schema)?;
                    // preparation is idempotent; an already-injected rule stays put
                    if !prepared.filters.contains(&expanded) {
                        prepared.filters.push(expanded);
                    }
                }
            }
        }

        Ok(prepared)
    }

    pub(crate) fn fetch_with<'a>(
        &'a self,
        ctx: &'a mut FetchExecutionContext,
        query: Query,
        options: &'a FetchOptions,
    ) -> BoxFuture<'a, Result<FetchSet, RetrievalError>> {
        Box::pin(async move {
            let entry_depth = ctx.depth();
            let result = self.fetch_inner(ctx, query, options).await;
            debug_assert_eq!(ctx.depth(), entry_depth, "ancestor stack must balance across fetch");
            result
        })
    }

    async fn fetch_inner(
        &self,
        ctx: &mut FetchExecutionContext,
        query: Query,
        options: &FetchOptions,
    ) -> Result<FetchSet, RetrievalError> {
        let mut query = self.prepare_query(&query, options)?;

        if let Some(cache) = &options.cache {
            if cache.can_cache_query(&query) && self.schema_for(options).can_cache_query(&query) {
                if let Some(set) = cache.resolve_from_cache(&query, &self.0.system, ctx, options).await {
                    return Ok(set);
                }
            }
        }

        // statements whose variables resolve without relation loading become
        // literals, opening them up to index selection
        self.substitute_plannable_vars(ctx, &mut query);

        let plan = select_index(&query, self.schema_for(options), options.skip_index)?;
        let mut candidates = candidate_stream(self.store(), &plan).await?;

        let mut set = FetchSet::default();
        let mut seen: HashSet<EntityId> = HashSet::new();
        let sort_needed = !plan.ordered && (!query.order.is_empty() || (query.after.is_some() && !plan.fulfilled.after));
        let mut gate = if plan.fulfilled.after { None } else { query.after.as_ref().map(|after| AfterGate::new(after, &query.order)) };
        let mut buffer: Vec<(EntityView, Vec<Triple>)> = Vec::new();
        let mut retraction_triples: Vec<(EntityId, Vec<Triple>)> = Vec::new();

        while let Some(id) = candidates.try_next().await? {
            if !seen.insert(id.clone()) {
                continue;
            }
            let (view, raw) = materialize(self.store(), &id, options.state_vector.as_ref()).await?;
            if view.is_empty() {
                continue;
            }
            if view.is_tombstoned() {
                // captured before the drop so the retraction stays visible
                retraction_triples.push((id, raw));
                continue;
            }
            if !in_collection(&view, &query.collection) {
                continue;
            }
            if !self.entity_matches(ctx, &query, &plan.fulfilled.filters, &view, options).await? {
                continue;
            }
            if sort_needed {
                buffer.push((view, raw));
            } else {
                if let Some(gate) = &mut gate {
                    if !gate.admit(&view) {
                        continue;
                    }
                }
                set.triples.insert(id.clone(), raw);
                set.results.insert(id, FetchedEntity { view, includes: BTreeMap::new() });
                if query.limit.map_or(false, |limit| set.results.len() >= limit) {
                    break;
                }
            }
        }

        if sort_needed {
            sort_by_order(&mut buffer, &query.order, |(view, _)| view);
            for (view, raw) in buffer {
                if let Some(gate) = &mut gate {
                    if !gate.admit(&view) {
                        continue;
                    }
                }
                let id = view.id().clone();
                set.triples.insert(id.clone(), raw);
                set.results.insert(id, FetchedEntity { view, includes: BTreeMap::new() });
                if query.limit.map_or(false, |limit| set.results.len() >= limit) {
                    break;
                }
            }
        }

        for (id, raw) in retraction_triples {
            set.triples.entry(id).or_insert(raw);
        }

        if !query.include.is_empty() {
            let page: Vec<EntityId> = set.results.keys().cloned().collect();
            for id in page {
                let view = match set.results.get(&id) {
                    Some(entity) => entity.view.clone(),
                    None => continue,
                };
                let (includes, sub_triples) = self.run_includes(ctx, &view, &query, options).await?;
                if let Some(entity) = set.results.get_mut(&id) {
                    entity.includes = includes;
                }
                for (sub_id, triples) in sub_triples {
                    set.triples.entry(sub_id).or_insert(triples);
                }
            }
        }

        if let Some(cache) = &options.cache {
            if cache.can_cache_query(&query) && self.schema_for(options).can_cache_query(&query) {
                cache.store(&query, &self.0.system, &set);
            }
        }

        Ok(set)
    }

    /// Run a related query for one parent entity: push the ancestor frame,
    /// merge parent and child vars (child wins), dispatch, pop. The pop is
    /// unconditional - failures still unwind the stack.
    pub(crate) async fn run_subquery(
        &self,
        ctx: &mut FetchExecutionContext,
        parent: &EntityView,
        parent_vars: &BTreeMap<String, Value>,
        sub: &Query,
        cardinality: Cardinality,
        options: &FetchOptions,
    ) -> Result<FetchSet, RetrievalError> {
        let frame = frame_from_entity(parent, self.schema_for(options));
        let mut sub = sub.clone();
        for (name, value) in parent_vars {
            sub.vars.entry(name.clone()).or_insert_with(|| value.clone());
        }
        if cardinality == Cardinality::One && sub.limit.is_none() {
            sub.limit = Some(1);
        }

        ctx.push(frame);
        let result = self.fetch_with(ctx, sub, options).await;
        ctx.pop();
        result
    }

    async fn run_includes(
        &self,
        ctx: &mut FetchExecutionContext,
        parent: &EntityView,
        query: &Query,
        options: &FetchOptions,
    ) -> Result<(BTreeMap<String, IncludedValue>, Vec<(EntityId, Vec<Triple>)>), RetrievalError> {
        let mut includes = BTreeMap::new();
        let mut collected = Vec::new();
        for (alias, include) in &query.include {
            let (sub, cardinality) = match include {
                Include::Subquery { query, cardinality } => (query.as_ref(), *cardinality),
                _ => return Err(RetrievalError::QueryNotPrepared(format!("include '{}' was not canonicalized", alias))),
            };
            let sub_set = self.run_subquery(ctx, parent, &query.vars, sub, cardinality, options).await?;
            collected.extend(sub_set.triples);
            let value = match cardinality {
                Cardinality::One => IncludedValue::One(sub_set.results.into_iter().next().map(|(_, entity)| Box::new(entity))),
                Cardinality::Many => IncludedValue::Many(sub_set.results),
            };
            includes.insert(alias.clone(), value);
        }
        Ok((includes, collected))
    }

    /// Rewrite top-level statements whose variables resolve without relation
    /// loading into literal statements.
    fn substitute_plannable_vars(&self, ctx: &FetchExecutionContext, query: &mut Query) {
        let vars = query.vars.clone();
        for filter in &mut query.filters {
            let Filter::Statement(statement) = filter else { continue };
            let FilterValue::Var(var) = &statement.value else { continue };
            match self.resolve_var_cheap(ctx, &vars, var) {
                Some(Resolved::One(value)) => statement.value = FilterValue::Value(value),
                Some(Resolved::Many(values)) => statement.value = FilterValue::Values(values),
                _ => {}
            }
        }
    }

    /// Variable resolution without relation loading; `None` when the path
    /// would need a load or the name is undefined.
    fn resolve_var_cheap(&self, ctx: &FetchExecutionContext, query_vars: &BTreeMap<String, Value>, var: &VarRef) -> Option<Resolved> {
        match &var.scope {
            VarScope::Global => lookup_in_map(&self.0.system.global, &var.path).map(Resolved::One),
            VarScope::Session => lookup_in_map(&self.0.system.session, &var.path).map(Resolved::One),
            VarScope::Role => lookup_in_map(&self.0.system.role_vars(), &var.path).map(Resolved::One),
            VarScope::Query => lookup_in_map(query_vars, &var.path).map(Resolved::One),
            VarScope::Ancestor(frames_up) => {
                let frame = ctx.frame(*frames_up)?;
                match frame.value(&var.path) {
                    Some(Resolved::One(value)) => Some(Resolved::One(value)),
                    // undefined or relation-crossing: leave the variable in place
                    _ => None,
                }
            }
            VarScope::Unscoped => None,
        }
    }

    /// Full variable resolution, lazily loading cardinality-one relations a
    /// path crosses.
    pub(crate) async fn resolve_filter_value(
        &self,
        ctx: &mut FetchExecutionContext,
        query: &Query,
        value: &FilterValue,
        options: &FetchOptions,
    ) -> Result<Resolved, RetrievalError> {
        match value {
            FilterValue::Value(value) => Ok(Resolved::One(value.clone())),
            FilterValue::Values(values) => Ok(Resolved::Many(values.clone())),
            FilterValue::Var(var) => self.resolve_var(ctx, query, var, options).await,
        }
    }

    pub(crate) async fn resolve_var(
        &self,
        ctx: &mut FetchExecutionContext,
        query: &Query,
        var: &VarRef,
        options: &FetchOptions,
    ) -> Result<Resolved, RetrievalError> {
        match &var.scope {
            VarScope::Global => Ok(lookup_in_map(&self.0.system.global, &var.path).map(Resolved::One).unwrap_or(Resolved::Undefined)),
            VarScope::Session => Ok(lookup_in_map(&self.0.system.session, &var.path).map(Resolved::One).unwrap_or(Resolved::Undefined)),
            VarScope::Role => Ok(lookup_in_map(&self.0.system.role_vars(), &var.path).map(Resolved::One).unwrap_or(Resolved::Undefined)),
            VarScope::Query => Ok(lookup_in_map(&query.vars, &var.path).map(Resolved::One).unwrap_or(Resolved::Undefined)),
            VarScope::Unscoped => Ok(flat_lookup(ctx, &self.0.system, query, &var.path)),
            VarScope::Ancestor(frames_up) => self.resolve_ancestor(ctx, *frames_up, var, options).await,
        }
    }

    async fn resolve_ancestor(
        &self,
        ctx: &mut FetchExecutionContext,
        frames_up: u32,
        var: &VarRef,
        options: &FetchOptions,
    ) -> Result<Resolved, RetrievalError> {
        if frames_up == 0 {
            return Err(RetrievalError::InvalidFilter(format!("variable {} references the unused frame 0", var)));
        }
        let Some(frame) = ctx.frame(frames_up) else {
            return Err(RetrievalError::InvalidFilter(format!("variable {} references a missing ancestor frame", var)));
        };
        if let Some(resolved) = frame.value(&var.path) {
            return Ok(resolved);
        }
        // the path crosses a relation; pull the related entity in
        let frame = frame.clone();
        let Some((prefix, def)) = relation_at(self.schema_for(options), &frame.collection, &var.path) else {
            return Ok(Resolved::Undefined);
        };
        self.check_relation_cardinality(var, &prefix, &def)?;

        let relation_name = prefix.to_string();
        let rest = match var.path.strip_prefix(&prefix) {
            Some(rest) if !rest.is_empty() => AttrPath::new(rest.to_vec()),
            _ => return Err(RetrievalError::InvalidFilter(format!("variable {} names a relation, not a value", var))),
        };

        let related = match frame.loaded_relations.get(&relation_name) {
            Some(cached) => cached.clone(),
            None => {
                let loaded = self.load_relation(ctx, &frame, &def, options).await?;
                if let Some(owner) = ctx.frame_mut(frames_up) {
                    owner.loaded_relations.insert(relation_name, loaded.clone());
                }
                loaded
            }
        };

        match related {
            None => Ok(Resolved::Undefined),
            Some(related) => self.resolve_through(ctx, related, rest, var, options).await,
        }
    }

    /// Resolve the remaining path within an already loaded frame, recursing
    /// through further cardinality-one relations.
    fn resolve_through<'a>(
        &'a self,
        ctx: &'a mut FetchExecutionContext,
        frame: Frame,
        path: AttrPath,
        var: &'a VarRef,
        options: &'a FetchOptions,
    ) -> BoxFuture<'a, Result<Resolved, RetrievalError>> {
        Box::pin(async move {
            if let Some(resolved) = frame.value(&path) {
                return Ok(resolved);
            }
            let Some((prefix, def)) = relation_at(self.schema_for(options), &frame.collection, &path) else {
                return Ok(Resolved::Undefined);
            };
            self.check_relation_cardinality(var, &prefix, &def)?;
            let rest = match path.strip_prefix(&prefix) {
                Some(rest) if !rest.is_empty() => AttrPath::new(rest.to_vec()),
                _ => return Err(RetrievalError::InvalidFilter(format!("variable {} names a relation, not a value", var))),
            };
            match self.load_relation(ctx, &frame, &def, options).await? {
                None => Ok(Resolved::Undefined),
                Some(related) => self.resolve_through(ctx, related, rest, var, options).await,
            }
        })
    }

    fn check_relation_cardinality(&self, var: &VarRef, prefix: &AttrPath, def: &RelationDef) -> Result<(), RetrievalError> {
        if def.cardinality != Cardinality::One {
            return Err(RetrievalError::VariableRelationCardinality { var: var.to_string(), relation: prefix.to_string() });
        }
        Ok(())
    }

    /// Fetch the single entity behind a cardinality-one relation of the
    /// given frame.
    async fn load_relation(
        &self,
        ctx: &mut FetchExecutionContext,
        owner: &Frame,
        def: &RelationDef,
        options: &FetchOptions,
    ) -> Result<Option<Frame>, RetrievalError> {
        let mut sub = def.query.clone();
        sub.limit = Some(1);

        ctx.push(owner.clone());
        let result = self.fetch_with(ctx, sub, options).await;
        ctx.pop();

        let set = result?;
        let schema = self.schema_for(options);
        Ok(set.results.into_iter().next().map(|(_, entity)| frame_from_entity(&entity.view, schema)))
    }
}

/// Expand exists-relation sugar and relation-crossing statement paths into
/// sub-query-exists filters.
pub(crate) fn expand_filter(filter: &Filter, collection: &CollectionId, schema: &dyn SchemaService) -> Result<Filter, RetrievalError> {
    match filter {
        Filter::And(group) => {
            Ok(Filter::And(group.iter().map(|f| expand_filter(f, collection, schema)).collect::<Result<Vec<_>, _>>()?))
        }
        Filter::Or(group) => Ok(Filter::Or(group.iter().map(|f| expand_filter(f, collection, schema)).collect::<Result<Vec<_>, _>>()?)),
        Filter::ExistsRelation { path, filters } => {
            let Some((prefix, def)) = relation_at(schema, collection, path) else {
                return Err(RetrievalError::UnknownRelation { collection: collection.to_string(), path: path.to_string() });
            };
            if &prefix != path {
                return Err(RetrievalError::UnknownRelation { collection: collection.to_string(), path: path.to_string() });
            }
            let mut sub = def.query;
            for filter in filters {
                sub.filters.push(expand_filter(filter, &sub.collection.clone(), schema)?);
            }
            Ok(Filter::SubqueryExists(Box::new(sub)))
        }
        Filter::Statement(statement) => {
            match relation_at(schema, collection, &statement.path) {
                Some((prefix, _)) if prefix.len() < statement.path.len() => {
                    // `author.name = x` becomes `exists author where name = x`
                    let rest = statement
                        .path
                        .strip_prefix(&prefix)
                        .map(|rest| AttrPath::new(rest.to_vec()))
                        .unwrap_or_else(|| statement.path.clone());
                    let inner = Filter::Statement(Statement { path: rest, op: statement.op, value: statement.value.clone() });
                    expand_filter(&Filter::ExistsRelation { path: prefix, filters: vec![inner] }, collection, schema)
                }
                Some((prefix, _)) => Err(RetrievalError::InvalidFilter(format!("statement targets relation {} directly", prefix))),
                None => Ok(filter.clone()),
            }
        }
        Filter::SubqueryExists(_) | Filter::Literal(_) => Ok(filter.clone()),
    }
}
