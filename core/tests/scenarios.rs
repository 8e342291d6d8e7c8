//! Conformance scenarios: index point, range scan with cursor,
//! sub-query exists, delta on insertion, tombstone, limit back-fill.

mod common;

use anyhow::Result;
use common::*;

use trellis_core::reactor::SubscriptionUpdate;
use trellis_proto::{Triple, Value, WriteBatch};
use trellis_query::{Cursor, Operator, OrderDirection, Query};
use trellis_storage_memory::MemoryTripleStore;

#[tokio::test]
async fn index_point_lookup() -> Result<()> {
    let store = MemoryTripleStore::new();
    // bare attribute triple, no _collection marker: membership falls back to
    // the id prefix
    store.insert(vec![Triple::new(eid("users#1"), "name", "Alice", ts(1))]);
    let engine = engine_for(&store);

    let query = Query::new("users").statement("id", Operator::Eq, "1");
    let result = engine.fetch(query, options()).await?;

    assert_eq!(fetch_ids(&result), vec!["users#1"]);
    let entity = &result.results[&eid("users#1")];
    assert_eq!(entity["id"], serde_json::json!("1"));
    assert_eq!(entity["name"], serde_json::json!("Alice"));
    Ok(())
}

#[tokio::test]
async fn range_scan_with_cursor() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    let engine = engine_for(&store);

    let query = Query::new("posts")
        .order_by("rank", OrderDirection::Asc)
        .limit(2)
        .after(Cursor::new(20i64, eid("posts#2")), false);
    let result = engine.fetch(query, options()).await?;

    assert_eq!(fetch_ids(&result), vec!["posts#3", "posts#4"]);
    Ok(())
}

#[tokio::test]
async fn subquery_exists() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    let result = engine.fetch(users_with_posts_query(), options()).await?;
    assert_eq!(fetch_ids(&result), vec!["users#1"]);
    Ok(())
}

#[tokio::test]
async fn delta_on_insertion() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    // user 2 gains a post; the write is applied, then the delta is derived
    let new_triples = entity_triples("posts#11", 5, &[("author_id", Value::from("2"))]);
    store.insert(new_triples.clone());

    let delta = engine.fetch_delta_triples(users_with_posts_query(), new_triples.clone(), options()).await?;

    // every users#2 triple enters (user 2 joins the result)...
    for attr in ["_collection", "name"] {
        assert!(
            delta.iter().any(|t| t.entity_id == eid("users#2") && t.attribute.to_string() == attr),
            "delta is missing users#2 {} triple: {:?}",
            attr,
            delta
        );
    }
    // ...plus the incoming post triples
    for triple in &new_triples {
        assert!(delta.contains(triple), "delta is missing the new post triple {}", triple);
    }
    // user 1 was already in the result on both sides; its triples stay home
    assert!(!delta.iter().any(|t| t.entity_id == eid("users#1")));
    Ok(())
}

#[tokio::test]
async fn delta_collects_triples_from_group_nested_subqueries() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_users_and_post(&store);
    let engine = engine_for(&store);

    // the exists lives inside an Or group, so it is not a tree edge and the
    // changed post itself never matches a permutation root; its triples can
    // only reach the delta through sub-query collection
    let sub = Query::new("posts").statement("author_id", Operator::Eq, trellis_query::FilterValue::Var(trellis_query::VarRef::ancestor(1, "id")));
    let query = Query::new("users").filter(trellis_query::Filter::Or(vec![
        trellis_query::Filter::Literal(false),
        trellis_query::Filter::exists(sub),
    ]));

    // a brand-new user and their first post arrive in one batch
    let mut new_triples = entity_triples("users#3", 5, &[("name", Value::from("Cara"))]);
    new_triples.extend(entity_triples("posts#12", 6, &[("author_id", Value::from("3"))]));
    store.insert(new_triples.clone());

    let delta = engine.fetch_delta_triples(query, new_triples.clone(), options()).await?;

    // users#3 enters the result, carried by the incoming batch
    for triple in new_triples.iter().filter(|t| t.entity_id == eid("users#3")) {
        assert!(delta.contains(triple), "delta is missing the new user triple {}", triple);
    }
    // the post that satisfies the nested exists must travel too
    for attr in ["_collection", "author_id"] {
        assert!(
            delta.iter().any(|t| t.entity_id == eid("posts#12") && t.attribute.to_string() == attr),
            "delta is missing posts#12 {} triple: {:?}",
            attr,
            delta
        );
    }
    Ok(())
}

#[tokio::test]
async fn tombstone_drops_entity_and_surfaces_retraction() -> Result<()> {
    let store = MemoryTripleStore::new();
    store.insert(entity_triples("users#1", 1, &[("name", Value::from("Alice"))]));
    let engine = engine_for(&store);

    let query = Query::new("users").statement("id", Operator::Eq, "1");

    let updates: Watcher<SubscriptionUpdate> = Watcher::new();
    let sink = updates.clone();
    let handle = engine
        .subscribe_results_and_triples(query.clone(), move |update| sink.push(update), None, options())
        .await?;
    updates.wait_for(1).await;
    assert_eq!(updates.values()[0].results.len(), 1);

    let tombstone = Triple::tombstone(eid("users#1"), ts(5));
    store.write(WriteBatch::inserts(vec![tombstone.clone()]));
    updates.wait_for(2).await;

    // fetch now returns nothing, with the retraction captured in its triples
    let result = engine.fetch(query, options()).await?;
    assert!(result.results.is_empty());
    assert!(result.triples[&eid("users#1")].contains(&tombstone));

    // the subscription emitted the removal with the tombstone triple
    let update = updates.values()[1].clone();
    assert!(update.results.is_empty());
    assert!(update.triples[&eid("users#1")].contains(&tombstone));

    handle.unsubscribe();
    Ok(())
}

#[tokio::test]
async fn limit_backfill_after_removal() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    let engine = engine_for(&store);

    let query = Query::new("posts").order_by("rank", OrderDirection::Asc).limit(2);

    let updates: Watcher<SubscriptionUpdate> = Watcher::new();
    let sink = updates.clone();
    let handle = engine
        .subscribe_results_and_triples(query, move |update| sink.push(update), None, options())
        .await?;
    updates.wait_for(1).await;
    let initial: Vec<String> = updates.values()[0].results.keys().map(|id| id.to_string()).collect();
    assert_eq!(initial, vec!["posts#1", "posts#2"]);

    store.write(WriteBatch::inserts(vec![Triple::tombstone(eid("posts#1"), ts(9))]));
    updates.wait_for(2).await;

    let after: Vec<String> = updates.values()[1].results.keys().map(|id| id.to_string()).collect();
    assert_eq!(after, vec!["posts#2", "posts#3"]);

    handle.unsubscribe();
    Ok(())
}

#[tokio::test]
async fn simple_subscription_admits_new_matches() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    let engine = engine_for(&store);

    let query = Query::new("posts").statement("rank", Operator::Gt, 35i64);

    let updates: Watcher<SubscriptionUpdate> = Watcher::new();
    let sink = updates.clone();
    let handle = engine
        .subscribe_results_and_triples(query, move |update| sink.push(update), None, options())
        .await?;
    updates.wait_for(1).await;
    assert_eq!(updates.values()[0].results.len(), 2); // ranks 40, 50

    store.insert(entity_triples("posts#6", 7, &[("rank", Value::I64(60))]));
    updates.wait_for(2).await;
    assert!(updates.values()[1].results.contains_key(&eid("posts#6")));

    // an unrelated low-rank write changes nothing
    store.insert(entity_triples("posts#7", 8, &[("rank", Value::I64(5))]));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(updates.len(), 2);

    handle.unsubscribe();
    Ok(())
}

#[tokio::test]
async fn subscribe_variants_project_their_payloads() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    let engine = engine_for(&store);

    let results_seen: Watcher<Vec<String>> = Watcher::new();
    let sink = results_seen.clone();
    let _results_sub = engine
        .subscribe(
            Query::new("posts").statement("rank", Operator::Gte, 40i64),
            move |results| sink.push(results.keys().map(|id| id.to_string()).collect()),
            None,
            options(),
        )
        .await?;

    let triples_seen: Watcher<usize> = Watcher::new();
    let sink = triples_seen.clone();
    let _triples_sub = engine
        .subscribe_triples(Query::new("posts").statement("rank", Operator::Gte, 40i64), move |triples| sink.push(triples.len()), None, options())
        .await?;

    results_seen.wait_for(1).await;
    triples_seen.wait_for(1).await;
    assert_eq!(results_seen.values()[0], vec!["posts#4", "posts#5"]);
    assert_eq!(triples_seen.values()[0], 2);
    Ok(())
}

#[tokio::test]
async fn unsubscribe_detaches_the_write_handler() -> Result<()> {
    let store = MemoryTripleStore::new();
    seed_ranked_posts(&store);
    let engine = engine_for(&store);

    let updates: Watcher<SubscriptionUpdate> = Watcher::new();
    let sink = updates.clone();
    let handle = engine
        .subscribe_results_and_triples(Query::new("posts"), move |update| sink.push(update), None, options())
        .await?;
    updates.wait_for(1).await;

    handle.unsubscribe();
    store.insert(entity_triples("posts#6", 7, &[("rank", Value::I64(60))]));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(updates.len(), 1);
    Ok(())
}
