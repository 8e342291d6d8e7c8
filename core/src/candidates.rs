//! Candidate streams: lazy, de-duplicated entity ids from the chosen access
//! path. Range and order scans surface one triple per matching version, so
//! the same entity can arrive many times; the dedup pass keeps the max
//! timestamp per (entity, attribute) and emits each entity at most once.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};

use trellis_proto::{AttrPath, EntityId, Timestamp};

use crate::{
    error::RetrievalError,
    plan::{collection_scan_key, AccessPath, Plan},
    storage::{TripleStoreApi, TripleStream},
};

pub type CandidateStream = BoxStream<'static, Result<EntityId, RetrievalError>>;

pub async fn candidate_stream(store: &dyn TripleStoreApi, plan: &Plan) -> Result<CandidateStream, RetrievalError> {
    match &plan.access {
        AccessPath::IdPoint { entity_id } => Ok(stream::iter(vec![Ok(entity_id.clone())]).boxed()),
        AccessPath::Equality { key, value } => {
            let triples = store.find_by_ave(key, Some(value)).await?;
            Ok(DedupIds::new(triples).boxed())
        }
        AccessPath::Range { key, range } | AccessPath::Order { key, range } => {
            let triples = store.find_values_in_range(key, range).await?;
            Ok(DedupIds::new(triples).boxed())
        }
        AccessPath::Scan { collection } => {
            // value unbounded: tombstoned entities stay candidates so their
            // retraction triples can be captured downstream
            let triples = store.find_by_ave(&collection_scan_key(collection), None).await?;
            Ok(DedupIds::new(triples).boxed())
        }
    }
}

/// Triple stream -> entity id stream.
///
/// An entity is emitted when an incoming triple's timestamp beats the
/// remembered max for its (entity, attribute) and the entity has not been
/// emitted yet. Distinct entities tying on value and timestamp each emit
/// once, in index iteration order.
pub struct DedupIds {
    inner: TripleStream,
    best: HashMap<(EntityId, AttrPath), Timestamp>,
    emitted: HashSet<EntityId>,
}

impl DedupIds {
    pub fn new(inner: TripleStream) -> Self { Self { inner, best: HashMap::new(), emitted: HashSet::new() } }
}

impl Stream for DedupIds {
    type Item = Result<EntityId, RetrievalError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(triple))) => {
                    let key = (triple.entity_id.clone(), triple.attribute.clone());
                    let beats = match this.best.get(&key) {
                        Some(seen) => triple.timestamp > *seen,
                        None => true,
                    };
                    if beats {
                        this.best.insert(key, triple.timestamp.clone());
                        if this.emitted.insert(triple.entity_id.clone()) {
                            return Poll::Ready(Some(Ok(triple.entity_id)));
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use trellis_proto::Triple;

    fn triple(entity: &str, attr: &str, tick: u64) -> Triple {
        Triple::new(EntityId::try_from(entity).unwrap(), attr, tick as i64, Timestamp::new(tick, "a"))
    }

    async fn dedup(triples: Vec<Triple>) -> Vec<String> {
        let inner: TripleStream = stream::iter(triples.into_iter().map(Ok)).boxed();
        DedupIds::new(inner).map_ok(|id| id.to_string()).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn emits_each_entity_once() {
        let ids = dedup(vec![triple("posts#1", "rank", 1), triple("posts#1", "rank", 2), triple("posts#2", "rank", 1)]).await;
        assert_eq!(ids, vec!["posts#1", "posts#2"]);
    }

    #[tokio::test]
    async fn stale_versions_do_not_reorder() {
        // the older version of posts#1 arrives after posts#2; it must not
        // re-emit posts#1
        let ids = dedup(vec![triple("posts#1", "rank", 5), triple("posts#2", "rank", 3), triple("posts#1", "rank", 1)]).await;
        assert_eq!(ids, vec!["posts#1", "posts#2"]);
    }

    #[tokio::test]
    async fn distinct_attributes_tracked_separately() {
        let mut triples = vec![triple("posts#1", "rank", 4)];
        triples.push(Triple::new(EntityId::try_from("posts#1").unwrap(), "title", "t", Timestamp::new(2, "a")));
        let ids = dedup(triples).await;
        assert_eq!(ids, vec!["posts#1"]);
    }
}
