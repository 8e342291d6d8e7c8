//! Shared fixtures: a blog-shaped schema over an in-memory store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use trellis_core::engine::{Engine, FetchOptions};
use trellis_core::schema::{DataType, ScalarType, StaticSchema};
use trellis_proto::{EntityId, Timestamp, Triple, Value};
use trellis_query::{Cardinality, FilterValue, Operator, Query, VarRef};
use trellis_storage_memory::MemoryTripleStore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn ts(tick: u64) -> Timestamp { Timestamp::new(tick, "a") }

pub fn eid(raw: &str) -> EntityId { EntityId::try_from(raw).unwrap() }

/// A `_collection` marker plus the given attribute triples, all at one tick.
pub fn entity_triples(id: &str, tick: u64, attrs: &[(&str, Value)]) -> Vec<Triple> {
    let id = eid(id);
    let mut out = vec![Triple::collection_marker(id.clone(), ts(tick))];
    for (path, value) in attrs {
        out.push(Triple::new(id.clone(), *path, value.clone(), ts(tick)));
    }
    out
}

pub fn blog_schema() -> StaticSchema {
    let posts_of_user = Query::new("posts").statement("author_id", Operator::Eq, FilterValue::Var(VarRef::ancestor(1, "id")));
    let author_of_post = Query::new("users").statement("id", Operator::Eq, FilterValue::Var(VarRef::ancestor(1, "author_id")));
    StaticSchema::new()
        .with_attr("users", "name", DataType::Scalar(ScalarType::String))
        .with_attr("posts", "rank", DataType::Scalar(ScalarType::Number))
        .with_attr("posts", "title", DataType::Scalar(ScalarType::String))
        .with_attr("posts", "author_id", DataType::Scalar(ScalarType::String))
        .with_attr("posts", "tags", DataType::Set(ScalarType::String))
        .with_relation("users", "posts", posts_of_user, Cardinality::Many)
        .with_relation("posts", "author", author_of_post, Cardinality::One)
}

pub fn engine_for(store: &MemoryTripleStore) -> Engine { Engine::new(Arc::new(store.clone()), Arc::new(blog_schema())) }

/// posts#1..=5 with ranks 10, 20, 30, 40, 50.
pub fn seed_ranked_posts(store: &MemoryTripleStore) {
    for n in 1u64..=5 {
        store.insert(entity_triples(&format!("posts#{}", n), n, &[("rank", Value::I64(n as i64 * 10))]));
    }
}

/// users 1 and 2, plus posts#10 authored by user 1 (scenario C shape).
pub fn seed_users_and_post(store: &MemoryTripleStore) {
    store.insert(entity_triples("users#1", 1, &[("name", Value::from("Alice"))]));
    store.insert(entity_triples("users#2", 1, &[("name", Value::from("Bob"))]));
    store.insert(entity_triples("posts#10", 2, &[("author_id", Value::from("1")), ("title", Value::from("hello"))]));
}

/// "users who have a post" (scenario C query).
pub fn users_with_posts_query() -> Query {
    let sub = Query::new("posts").statement("author_id", Operator::Eq, FilterValue::Var(VarRef::ancestor(1, "id")));
    Query::new("users").filter(trellis_query::Filter::exists(sub))
}

pub fn fetch_ids(result: &trellis_core::engine::FetchResult) -> Vec<String> {
    result.results.keys().map(|id| id.to_string()).collect()
}

pub fn options() -> FetchOptions { FetchOptions::default() }

/// Accumulates subscription emissions for later assertion.
#[derive(Clone)]
pub struct Watcher<T>(Arc<std::sync::Mutex<Vec<T>>>);

impl<T: Clone + Send + 'static> Watcher<T> {
    pub fn new() -> Self { Watcher(Arc::new(std::sync::Mutex::new(Vec::new()))) }

    pub fn push(&self, value: T) { self.0.lock().unwrap().push(value); }

    pub fn values(&self) -> Vec<T> { self.0.lock().unwrap().clone() }

    pub fn len(&self) -> usize { self.0.lock().unwrap().len() }

    /// Poll until at least `count` emissions arrived.
    pub async fn wait_for(&self, count: usize) {
        for _ in 0..200 {
            if self.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("watcher saw {} emissions, expected at least {}", self.len(), count);
    }
}
