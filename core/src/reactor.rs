//! Live subscriptions: a maintained `(results, result_triples)` pair per
//! query, updated incrementally as write batches arrive.
//!
//! Batches for one subscription are processed in arrival order and never
//! concurrently (a single drain task owns the channel). Queries with
//! sub-query filters, includes, or relation-crossing order keys are
//! "complex" and re-run the full fetch per batch; everything else takes the
//! incremental path with limit back-fill.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::{debug, error};

use trellis_proto::{EntityId, Triple, Value, WriteBatch};
use trellis_query::{After, Cursor, Query};

use crate::{
    engine::{Engine, FetchOptions, NativeEntity},
    entity::materialize,
    error::RetrievalError,
    fetch::{in_collection, FetchSet, FetchedEntity},
    schema::relation_at,
    sort::{compare_entities, is_after_cursor, sort_by_order},
    storage::WriteGuard,
    vars::FetchExecutionContext,
};

/// One emission: native results in order, plus the raw triples backing them.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub results: IndexMap<EntityId, NativeEntity>,
    pub triples: HashMap<EntityId, Vec<Triple>>,
}

pub type UpdateCallback = Arc<dyn Fn(SubscriptionUpdate) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(RetrievalError) + Send + Sync>;

/// Live subscription handle; dropping it (or calling `unsubscribe`) detaches
/// the write handler. An in-flight batch completes but its emission is
/// discarded.
pub struct SubscriptionHandle(Arc<SubscriptionInner>);

impl SubscriptionHandle {
    pub fn unsubscribe(&self) { self.0.close(); }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) { self.0.close(); }
}

struct SubscriptionInner {
    engine: Engine,
    query: Query,
    options: FetchOptions,
    complex: bool,
    on_update: UpdateCallback,
    on_error: Option<ErrorCallback>,
    state: tokio::sync::Mutex<LiveState>,
    closed: AtomicBool,
    write_guard: std::sync::Mutex<Option<Box<dyn WriteGuard>>>,
}

struct LiveState {
    set: FetchSet,
}

impl Engine {
    /// Install a live query; `on_results` fires with the initial result and
    /// after every batch that changes it.
    pub async fn subscribe(
        &self,
        query: Query,
        on_results: impl Fn(IndexMap<EntityId, NativeEntity>) + Send + Sync + 'static,
        on_error: Option<ErrorCallback>,
        options: FetchOptions,
    ) -> Result<SubscriptionHandle, RetrievalError> {
        self.subscribe_inner(query, Arc::new(move |update: SubscriptionUpdate| on_results(update.results)), on_error, options).await
    }

    pub async fn subscribe_results_and_triples(
        &self,
        query: Query,
        on_update: impl Fn(SubscriptionUpdate) + Send + Sync + 'static,
        on_error: Option<ErrorCallback>,
        options: FetchOptions,
    ) -> Result<SubscriptionHandle, RetrievalError> {
        self.subscribe_inner(query, Arc::new(on_update), on_error, options).await
    }

    pub async fn subscribe_triples(
        &self,
        query: Query,
        on_triples: impl Fn(HashMap<EntityId, Vec<Triple>>) + Send + Sync + 'static,
        on_error: Option<ErrorCallback>,
        options: FetchOptions,
    ) -> Result<SubscriptionHandle, RetrievalError> {
        self.subscribe_inner(query, Arc::new(move |update: SubscriptionUpdate| on_triples(update.triples)), on_error, options).await
    }

    async fn subscribe_inner(
        &self,
        query: Query,
        on_update: UpdateCallback,
        on_error: Option<ErrorCallback>,
        options: FetchOptions,
    ) -> Result<SubscriptionHandle, RetrievalError> {
        let prepared = self.prepare_query(&query, &options)?;
        let complex = is_complex(&prepared, self, &options);

        // observe writes before the initial fetch; batches landing during it
        // queue up and replay through the drain task afterwards
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteBatch>();
        let guard = self.store().on_write(Arc::new(move |batch| {
            let _ = tx.send(batch);
        }));

        let set = self.fetch_set(prepared.clone(), &options).await?;

        let inner = Arc::new(SubscriptionInner {
            engine: self.clone(),
            query: prepared,
            options,
            complex,
            on_update,
            on_error,
            state: tokio::sync::Mutex::new(LiveState { set }),
            closed: AtomicBool::new(false),
            write_guard: std::sync::Mutex::new(Some(guard)),
        });

        {
            let state = inner.state.lock().await;
            inner.emit(&state, HashMap::new());
        }

        let worker = inner.clone();
        let _drain = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                if worker.closed.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = worker.handle_batch(batch).await {
                    match &worker.on_error {
                        Some(on_error) => on_error(err),
                        None => error!(target: "trellis::reactor", error = %err, "subscription batch failed"),
                    }
                }
            }
        });

        Ok(SubscriptionHandle(inner))
    }
}

/// Complex queries re-run the full fetch per batch; the incremental path
/// only handles plain attribute predicates and orders.
fn is_complex(query: &Query, engine: &Engine, options: &FetchOptions) -> bool {
    if query.has_subquery_filter() || !query.include.is_empty() {
        return true;
    }
    let schema = engine.schema_for(options);
    query.order.iter().any(|item| relation_at(schema, &query.collection, &item.path).is_some())
}

impl SubscriptionInner {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // dropping the guard detaches the callback and closes the channel
        self.write_guard.lock().unwrap().take();
    }

    fn emit(&self, state: &LiveState, extra_triples: HashMap<EntityId, Vec<Triple>>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut triples = state.set.triples.clone();
        for (id, extra) in extra_triples {
            triples.entry(id).or_default().extend(extra);
        }
        let native = self.engine.to_native(FetchSet { results: state.set.results.clone(), triples: HashMap::new() }, &self.query, &self.options);
        (self.on_update)(SubscriptionUpdate { results: native.results, triples });
    }

    async fn handle_batch(&self, batch: WriteBatch) -> Result<(), RetrievalError> {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.complex {
            debug!(target: "trellis::reactor", collection = %self.query.collection, "complex query refetch");
            state.set = self.engine.fetch_set(self.query.clone(), &self.options).await?;
            self.emit(&state, HashMap::new());
            return Ok(());
        }

        // candidate ids: everything this batch wrote in our collection
        let mut candidates: IndexMap<EntityId, Vec<Triple>> = IndexMap::new();
        for triple in batch.inserts.iter().chain(batch.deletes.iter()) {
            if triple.entity_id.collection() == self.query.collection.as_str() {
                candidates.entry(triple.entity_id.clone()).or_default().push(triple.clone());
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let mut changed = false;
        let mut removed_triples: HashMap<EntityId, Vec<Triple>> = HashMap::new();

        for (id, wrote) in candidates {
            let (view, raw) = materialize(self.engine.store(), &id, self.options.state_vector.as_ref()).await?;
            let mut ctx = FetchExecutionContext::new();

            let alive = in_collection(&view, &self.query.collection);
            let matches = alive && self.engine.entity_matches(&mut ctx, &self.query, &[], &view, &self.options).await?;
            let admitted = matches && self.passes_after(&view) && self.in_window(&state, &view);
            let present = state.set.results.contains_key(&id);

            if admitted {
                state.set.results.insert(id.clone(), FetchedEntity { view, includes: BTreeMap::new() });
                state.set.triples.insert(id, raw);
                changed = true;
            } else if present {
                state.set.results.shift_remove(&id);
                state.set.triples.remove(&id);
                // the batch's own triples carry the retraction to the caller
                removed_triples.insert(id, wrote);
                changed = true;
            }
        }

        if !changed {
            return Ok(());
        }

        let mut entries: Vec<(EntityId, FetchedEntity)> = state.set.results.drain(..).collect();
        sort_by_order(&mut entries, &self.query.order, |(_, entity)| &entity.view);
        state.set.results = entries.into_iter().collect();

        if let Some(limit) = self.query.limit {
            if state.set.results.len() > limit {
                let dropped: Vec<EntityId> = state.set.results.keys().skip(limit).cloned().collect();
                state.set.results.truncate(limit);
                for id in dropped {
                    state.set.triples.remove(&id);
                }
            } else if state.set.results.len() < limit {
                self.backfill(&mut state, limit).await?;
            }
        }

        self.emit(&state, removed_triples);
        Ok(())
    }

    fn passes_after(&self, view: &crate::entity::EntityView) -> bool {
        match &self.query.after {
            Some(after) => is_after_cursor(view, after, &self.query.order),
            None => true,
        }
    }

    /// With a full limit window, a new entity only belongs if it sorts at or
    /// before the current last member.
    fn in_window(&self, state: &LiveState, view: &crate::entity::EntityView) -> bool {
        let Some(limit) = self.query.limit else { return true };
        if state.set.results.len() < limit || state.set.results.contains_key(view.id()) {
            return true;
        }
        match state.set.results.values().last() {
            Some(last) => compare_entities(view, &last.view, &self.query.order) != std::cmp::Ordering::Greater,
            None => true,
        }
    }

    /// The result fell short of the limit: fetch the gap starting just after
    /// the last remaining entry.
    async fn backfill(&self, state: &mut LiveState, limit: usize) -> Result<(), RetrievalError> {
        let mut gap_query = self.query.clone();
        gap_query.limit = Some(limit - state.set.results.len());
        gap_query.after = state.set.results.values().last().map(|last| {
            let value = self.query.order.first().and_then(|primary| last.view.get(&primary.path)).unwrap_or(Value::Null);
            After { cursor: Cursor { value, entity_id: last.view.id().clone() }, inclusive: false }
        });

        debug!(target: "trellis::reactor", collection = %self.query.collection, "limit under-full, backfilling");
        let gap = self.engine.fetch_set(gap_query, &self.options).await?;
        for (id, entity) in gap.results {
            if !state.set.results.contains_key(&id) {
                if let Some(triples) = gap.triples.get(&id) {
                    state.set.triples.insert(id.clone(), triples.clone());
                }
                state.set.results.insert(id, entity);
            }
        }
        state.set.results.truncate(limit);
        Ok(())
    }
}
