//! Engine-level properties: filter monotonicity, state-vector projection,
//! sort totality, cursor round-trips, delta reconciliation, permutation
//! agreement, and the error taxonomy.

mod common;

use anyhow::Result;
use common::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use trellis_core::engine::{Engine, FetchOptions};
use trellis_core::schema::{Rules, StaticSchema};
use trellis_core::vars::SystemVars;
use trellis_core::RetrievalError;
use trellis_proto::{StateVector, Value};
use trellis_query::{permute::root_permutations, Cursor, Filter, FilterValue, Include, Operator, OrderDirection, Query, VarRef, VarScope};
use trellis_storage_memory::MemoryTripleStore;

#[tokio::test]
async fn filtering_never_adds_results() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    let engine = engine_for(&store);

    let unfiltered = engine.fetch(Query::new("posts"), options()).await?;
    let filtered = engine.fetch(Query::new("posts").statement("rank", Operator::Gt, 25i64), options()).await?;

    for id in filtered.results.keys() {
        assert!(unfiltered.results.contains_key(id));
    }
    assert_eq!(fetch_ids(&filtered), vec!["posts#3", "posts#4", "posts#5"]);
    Ok(())
}

#[tokio::test]
async fn state_vector_projection_commutes_with_fetch() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    // a later write from another client bumps posts#1 out of range
    store.insert(vec![trellis_proto::Triple::new(eid("posts#1"), "rank", 99i64, trellis_proto::Timestamp::new(1, "b"))]);
    let engine = engine_for(&store);

    // frontier that has seen client a fully but not client b
    let mut sv = StateVector::new();
    sv.set("a", 100);
    let bounded = FetchOptions::default().with_state_vector(sv);

    let query = Query::new("posts").statement("rank", Operator::Lt, 30i64);
    let result = engine.fetch(query.clone(), bounded).await?;
    assert_eq!(fetch_ids(&result), vec!["posts#1", "posts#2"]);

    // the same query over a store that never saw client b agrees
    let truncated = MemoryTripleStore::new();
    seed_ranked_posts(&truncated);
    let engine2 = engine_for(&truncated);
    let expected = engine2.fetch(query, options()).await?;
    assert_eq!(fetch_ids(&result), fetch_ids(&expected));
    Ok(())
}

#[tokio::test]
async fn sort_breaks_ties_by_entity_id() -> Result<()> {
    let store = MemoryTripleStore::new();
    store.insert(entity_triples("posts#2", 1, &[("rank", Value::I64(10))]));
    store.insert(entity_triples("posts#1", 2, &[("rank", Value::I64(10))]));
    store.insert(entity_triples("posts#3", 3, &[("rank", Value::I64(5))]));
    let engine = engine_for(&store);

    let result = engine.fetch(Query::new("posts").order_by("rank", OrderDirection::Asc), options()).await?;
    assert_eq!(fetch_ids(&result), vec!["posts#3", "posts#1", "posts#2"]);
    Ok(())
}

#[tokio::test]
async fn cursor_round_trip_equals_larger_limit() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    let engine = engine_for(&store);

    let base = Query::new("posts").order_by("rank", OrderDirection::Asc);
    let first = engine.fetch(base.clone().limit(2), options()).await?;
    assert_eq!(fetch_ids(&first), vec!["posts#1", "posts#2"]);

    let last = first.results.keys().last().unwrap().clone();
    let last_rank = first.results[&last]["rank"].as_i64().unwrap();
    let second = engine.fetch(base.clone().limit(2).after(Cursor::new(last_rank, last), false), options()).await?;

    let mut stitched = fetch_ids(&first);
    stitched.extend(fetch_ids(&second));
    let full = engine.fetch(base.limit(4), options()).await?;
    assert_eq!(stitched, fetch_ids(&full));
    Ok(())
}

#[tokio::test]
async fn delta_reconciles_a_local_replica() -> Result<()> {
    let server = MemoryTripleStore::new();
    seed_users_and_post(&server);

    // the replica is in sync before the write
    let replica = MemoryTripleStore::new();
    seed_users_and_post(&replica);

    let engine = engine_for(&server);
    let new_triples = entity_triples("posts#11", 5, &[("author_id", Value::from("2"))]);
    server.insert(new_triples.clone());

    let delta = engine.fetch_delta_triples(users_with_posts_query(), new_triples, options()).await?;
    replica.insert(delta);

    let replica_engine = engine_for(&replica);
    let local = replica_engine.fetch(users_with_posts_query(), options()).await?;
    let remote = engine.fetch(users_with_posts_query(), options()).await?;
    assert_eq!(fetch_ids(&local), fetch_ids(&remote));
    assert_eq!(fetch_ids(&local), vec!["users#1", "users#2"]);
    Ok(())
}

#[tokio::test]
async fn root_permutations_agree_on_membership() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    let permutations = root_permutations(&users_with_posts_query())?;
    assert_eq!(permutations.len(), 2);

    let users_side = engine.fetch(permutations[0].clone(), options()).await?;
    assert_eq!(fetch_ids(&users_side), vec!["users#1"]);

    // the posts-rooted permutation selects the other side of the same edge
    let posts_side = engine.fetch(permutations[1].clone(), options()).await?;
    assert_eq!(fetch_ids(&posts_side), vec!["posts#10"]);
    Ok(())
}

#[tokio::test]
async fn includes_expand_from_schema() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    let query = Query::new("users").statement("id", Operator::Eq, "1").include("posts", Include::SchemaDefault);
    let result = engine.fetch(query, options()).await?;
    let user = &result.results[&eid("users#1")];
    let posts = user["posts"].as_array().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["title"], serde_json::json!("hello"));
    // the included entity's triples travel with the result
    assert!(result.triples.contains_key(&eid("posts#10")));
    Ok(())
}

#[tokio::test]
async fn include_of_unknown_relation_fails() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    let query = Query::new("users").include("followers", Include::SchemaDefault);
    match engine.fetch(query, options()).await {
        Err(RetrievalError::UnknownRelation { path, .. }) => assert_eq!(path, "followers"),
        other => panic!("expected UnknownRelation, got {:?}", other.map(|r| fetch_ids(&r))),
    }
    Ok(())
}

#[tokio::test]
async fn variable_through_many_relation_fails() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    // $1.posts.title crosses the cardinality-many posts relation
    let sub = Query::new("posts").statement("title", Operator::Eq, FilterValue::Var(VarRef::ancestor(1, "posts.title")));
    let query = Query::new("users").filter(Filter::exists(sub));
    match engine.fetch(query, options()).await {
        Err(RetrievalError::VariableRelationCardinality { relation, .. }) => assert_eq!(relation, "posts"),
        other => panic!("expected VariableRelationCardinality, got {:?}", other.map(|r| fetch_ids(&r))),
    }
    Ok(())
}

#[tokio::test]
async fn variable_loads_cardinality_one_relation_lazily() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    // posts whose author's name is some user's name: exercises the lazy
    // $1.author.name load through the cardinality-one relation
    let sub = Query::new("users").statement("name", Operator::Eq, FilterValue::Var(VarRef::ancestor(1, "author.name")));
    let query = Query::new("posts").filter(Filter::exists(sub));
    let result = engine.fetch(query, options()).await?;
    assert_eq!(fetch_ids(&result), vec!["posts#10"]);
    Ok(())
}

#[tokio::test]
async fn session_variables_resolve() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);

    let mut system = SystemVars::default();
    system.session.insert("user_id".to_string(), Value::from("2"));
    let engine = Engine::with_system_vars(Arc::new(store.clone()), Arc::new(blog_schema()), system);

    let query = Query::new("users").statement("id", Operator::Eq, FilterValue::Var(VarRef::new(VarScope::Session, "user_id")));
    let result = engine.fetch(query, options()).await?;
    assert_eq!(fetch_ids(&result), vec!["users#2"]);
    Ok(())
}

#[tokio::test]
async fn read_rules_are_injected_unless_skipped() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);

    let schema = blog_schema().with_rules(
        "posts",
        Rules { read_filters: vec![Filter::Statement(trellis_query::Statement::new("rank", Operator::Gt, 25i64))] },
    );
    let engine = Engine::new(Arc::new(store.clone()), Arc::new(schema));

    let ruled = engine.fetch(Query::new("posts"), options()).await?;
    assert_eq!(fetch_ids(&ruled), vec!["posts#3", "posts#4", "posts#5"]);

    let mut opts = options();
    opts.skip_rules = true;
    let unruled = engine.fetch(Query::new("posts"), opts).await?;
    assert_eq!(unruled.results.len(), 5);
    Ok(())
}

#[tokio::test]
async fn select_restricts_leaf_paths() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    let mut query = Query::new("posts").statement("id", Operator::Eq, "10");
    query.select = Some(vec!["title".into()]);
    let result = engine.fetch(query, options()).await?;
    let post = &result.results[&eid("posts#10")];
    assert_eq!(post["title"], serde_json::json!("hello"));
    assert!(post.get("author_id").is_none());
    assert!(post.get("id").is_some());
    Ok(())
}

#[tokio::test]
async fn set_membership_filters() -> Result<()> {
    let store = MemoryTripleStore::new();
    store.insert(entity_triples(
        "posts#1",
        1,
        &[("tags.rust", Value::Bool(true)), ("tags.go", Value::Bool(true)), ("rank", Value::I64(1))],
    ));
    store.insert(entity_triples("posts#2", 2, &[("tags.go", Value::Bool(true)), ("rank", Value::I64(2))]));
    let engine = engine_for(&store);

    let has = engine.fetch(Query::new("posts").statement("tags", Operator::Has, "rust"), options()).await?;
    assert_eq!(fetch_ids(&has), vec!["posts#1"]);

    // equality on a set is membership, backed by the member index
    let eq = engine.fetch(Query::new("posts").statement("tags", Operator::Eq, "go"), options()).await?;
    assert_eq!(eq.results.len(), 2);

    let not_has = engine.fetch(Query::new("posts").statement("tags", Operator::NotHas, "rust"), options()).await?;
    assert_eq!(fetch_ids(&not_has), vec!["posts#2"]);

    // set attributes render as arrays
    assert_eq!(has.results[&eid("posts#1")]["tags"], serde_json::json!(["go", "rust"]));
    Ok(())
}

#[tokio::test]
async fn like_and_ranges_compose() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    let like = engine.fetch(Query::new("users").statement("name", Operator::Like, "Ali%"), options()).await?;
    assert_eq!(fetch_ids(&like), vec!["users#1"]);

    let nlike = engine.fetch(Query::new("users").statement("name", Operator::NotLike, "Ali%"), options()).await?;
    assert_eq!(fetch_ids(&nlike), vec!["users#2"]);
    Ok(())
}

#[tokio::test]
async fn skip_index_agrees_with_indexed_plan() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    // scenario: entity also indexed under stale rank versions
    store.insert(vec![trellis_proto::Triple::new(eid("posts#1"), "rank", 70i64, ts(8))]);
    let engine = engine_for(&store);

    let query = Query::new("posts").statement("rank", Operator::Gt, 45i64);
    let indexed = engine.fetch(query.clone(), options()).await?;

    let mut opts = options();
    opts.skip_index = true;
    let scanned = engine.fetch(query, opts).await?;
    // no ORDER BY, so only membership is comparable across plans
    let mut indexed_ids = fetch_ids(&indexed);
    indexed_ids.sort();
    let mut scanned_ids = fetch_ids(&scanned);
    scanned_ids.sort();
    assert_eq!(indexed_ids, scanned_ids);
    assert_eq!(indexed_ids, vec!["posts#1", "posts#5"]);
    Ok(())
}

#[tokio::test]
async fn query_scoped_vars_merge_into_subqueries() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    // the inner query reads $query.min_title through var merging
    let sub = Query::new("posts")
        .statement("author_id", Operator::Eq, FilterValue::Var(VarRef::ancestor(1, "id")))
        .statement("title", Operator::Eq, FilterValue::Var(VarRef::new(VarScope::Query, "wanted_title")));
    let query = Query::new("users").filter(Filter::exists(sub)).var("wanted_title", "hello");
    let result = engine.fetch(query, options()).await?;
    assert_eq!(fetch_ids(&result), vec!["users#1"]);

    let sub = Query::new("posts")
        .statement("author_id", Operator::Eq, FilterValue::Var(VarRef::ancestor(1, "id")))
        .statement("title", Operator::Eq, FilterValue::Var(VarRef::new(VarScope::Query, "wanted_title")));
    let query = Query::new("users").filter(Filter::exists(sub)).var("wanted_title", "missing");
    let result = engine.fetch(query, options()).await?;
    assert!(result.results.is_empty());
    Ok(())
}

#[tokio::test]
async fn fetch_one_returns_first_in_order() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    let engine = engine_for(&store);

    let query = Query::new("posts").order_by("rank", OrderDirection::Desc);
    let result = engine.fetch_one(query, options()).await?;
    assert_eq!(result.result.unwrap()["rank"], serde_json::json!(50));
    Ok(())
}

#[tokio::test]
async fn unscoped_vars_fall_back_to_flat_merge() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);

    let mut system = SystemVars::default();
    system.global.insert("user_id".to_string(), Value::from("1"));
    let engine = Engine::with_system_vars(Arc::new(store.clone()), Arc::new(blog_schema()), system);

    let query = Query::new("users").statement("id", Operator::Eq, FilterValue::Var(VarRef::new(VarScope::Unscoped, "user_id")));
    let result = engine.fetch(query, options()).await?;
    assert_eq!(fetch_ids(&result), vec!["users#1"]);
    Ok(())
}

#[tokio::test]
async fn role_vars_resolve() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);

    let mut vars = BTreeMap::new();
    vars.insert("allowed_author".to_string(), Value::from("1"));
    let system = SystemVars { roles: vec![trellis_core::schema::Role { name: "author".to_string(), vars }], ..Default::default() };
    let engine = Engine::with_system_vars(Arc::new(store.clone()), Arc::new(blog_schema()), system);

    let query = Query::new("posts").statement("author_id", Operator::Eq, FilterValue::Var(VarRef::new(VarScope::Role, "allowed_author")));
    let result = engine.fetch(query, options()).await?;
    assert_eq!(fetch_ids(&result), vec!["posts#10"]);
    Ok(())
}

#[tokio::test]
async fn statement_across_one_relation_expands_to_exists() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    // `author.name = 'Alice'` expands into exists(author where name = 'Alice')
    let query = Query::new("posts").statement("author.name", Operator::Eq, "Alice");
    let result = engine.fetch(query, options()).await?;
    assert_eq!(fetch_ids(&result), vec!["posts#10"]);

    let query = Query::new("posts").statement("author.name", Operator::Eq, "Bob");
    let result = engine.fetch(query, options()).await?;
    assert!(result.results.is_empty());
    Ok(())
}

/// Schema fixture sanity: the rules-based schema still honors other tests'
/// assumptions.
#[test]
fn static_schema_composes() {
    let schema: StaticSchema = blog_schema();
    let _ = schema.with_rules("posts", Rules::default());
}

mod cache {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use trellis_core::cache::QueryCache;
    use trellis_core::fetch::FetchSet;
    use trellis_core::schema::{DataType, Rules, SchemaService};
    use trellis_core::vars::{FetchExecutionContext, SystemVars};
    use trellis_proto::{AttrPath, CollectionId};

    /// Marks every query cachable, delegating the rest to the blog schema.
    struct CachingSchema(StaticSchema);

    impl SchemaService for CachingSchema {
        fn get_attribute(&self, collection: &CollectionId, path: &AttrPath) -> Option<DataType> { self.0.get_attribute(collection, path) }
        fn get_collection_rules(&self, collection: &CollectionId) -> Option<Rules> { self.0.get_collection_rules(collection) }
        fn scalar_attributes(&self, collection: &CollectionId) -> Vec<AttrPath> { self.0.scalar_attributes(collection) }
        fn can_cache_query(&self, _query: &Query) -> bool { true }
    }

    #[derive(Default)]
    struct MemoCache {
        hits: AtomicUsize,
        entries: Mutex<Vec<(Query, FetchSet)>>,
    }

    #[async_trait]
    impl QueryCache for MemoCache {
        fn can_cache_query(&self, _query: &Query) -> bool { true }

        async fn resolve_from_cache(
            &self,
            query: &Query,
            _system_vars: &SystemVars,
            _ctx: &FetchExecutionContext,
            _options: &FetchOptions,
        ) -> Option<FetchSet> {
            let entries = self.entries.lock().unwrap();
            let found = entries.iter().find(|(cached, _)| cached == query).map(|(_, set)| set.clone());
            if found.is_some() {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
            found
        }

        fn store(&self, query: &Query, _system_vars: &SystemVars, set: &FetchSet) {
            self.entries.lock().unwrap().push((query.clone(), set.clone()));
        }
    }

    #[tokio::test]
    async fn cachable_queries_compute_once() -> Result<()> {
        let store = MemoryTripleStore::new();
        seed_ranked_posts(&store);
        let engine = Engine::new(Arc::new(store.clone()), Arc::new(CachingSchema(blog_schema())));

        let cache = Arc::new(MemoCache::default());
        let mut opts = options();
        opts.cache = Some(cache.clone() as Arc<dyn QueryCache>);

        let query = Query::new("posts").statement("rank", Operator::Gt, 25i64);
        let first = engine.fetch(query.clone(), opts.clone()).await?;
        assert_eq!(cache.hits.load(Ordering::SeqCst), 0);

        let second = engine.fetch(query, opts).await?;
        assert_eq!(cache.hits.load(Ordering::SeqCst), 1);
        assert_eq!(fetch_ids(&first), fetch_ids(&second));
        Ok(())
    }
}
