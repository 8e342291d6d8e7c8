//! In-memory reference implementation of the triple-store index API.
//!
//! An ordered AVE index (attribute key, collated value bytes, entity id,
//! timestamp) over an append-only triple log, the same key discipline a KV
//! engine would persist. Every find call snapshots its matches before the
//! stream is returned, so one call observes one consistent state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::debug;

use trellis_core::collation::{compare, compare_keyed, encode_value};
use trellis_core::storage::{Cmp, RangeQuery, ScanDirection, StorageError, TripleStoreApi, TripleStream, WriteCallback, WriteGuard};
use trellis_proto::{EntityId, Timestamp, Triple, Value, WriteBatch};

/// (attribute key, collated value, entity id, timestamp) - the tuple order is
/// the scan order.
type AveKey = (Vec<String>, Vec<u8>, String, Timestamp);

fn ave_key(triple: &Triple) -> AveKey {
    let mut key = Vec::with_capacity(1 + triple.attribute.len());
    key.push(triple.entity_id.collection().to_string());
    key.extend(triple.attribute.segments().iter().cloned());
    (key, encode_value(&triple.value), triple.entity_id.to_string(), triple.timestamp.clone())
}

fn key_floor(key: &[String]) -> AveKey { (key.to_vec(), Vec::new(), String::new(), Timestamp::new(0, "")) }

fn key_ceiling(key: &[String]) -> AveKey {
    let mut successor = key.to_vec();
    successor.push(String::new());
    (successor, Vec::new(), String::new(), Timestamp::new(0, ""))
}

#[derive(Default)]
struct StoreState {
    by_entity: BTreeMap<EntityId, Vec<Triple>>,
    ave: BTreeMap<AveKey, Triple>,
}

impl StoreState {
    fn insert(&mut self, triple: Triple) {
        self.ave.insert(ave_key(&triple), triple.clone());
        self.by_entity.entry(triple.entity_id.clone()).or_default().push(triple);
    }

    fn remove(&mut self, triple: &Triple) {
        self.ave.remove(&ave_key(triple));
        if let Some(versions) = self.by_entity.get_mut(&triple.entity_id) {
            versions.retain(|t| t != triple);
            if versions.is_empty() {
                self.by_entity.remove(&triple.entity_id);
            }
        }
    }
}

struct Inner {
    state: RwLock<StoreState>,
    watchers: Mutex<Vec<(u64, WriteCallback)>>,
    next_watcher_id: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryTripleStore(Arc<Inner>);

impl Default for MemoryTripleStore {
    fn default() -> Self { Self::new() }
}

impl MemoryTripleStore {
    pub fn new() -> Self {
        MemoryTripleStore(Arc::new(Inner {
            state: RwLock::new(StoreState::default()),
            watchers: Mutex::new(Vec::new()),
            next_watcher_id: AtomicU64::new(1),
        }))
    }

    /// Apply one source transaction and notify write observers.
    pub fn write(&self, batch: WriteBatch) {
        {
            let mut state = self.0.state.write().unwrap();
            for triple in &batch.inserts {
                state.insert(triple.clone());
            }
            for triple in &batch.deletes {
                state.remove(triple);
            }
        }
        let watchers: Vec<(u64, WriteCallback)> = self.0.watchers.lock().unwrap().clone();
        debug!(target: "trellis::storage", inserts = batch.inserts.len(), deletes = batch.deletes.len(), watchers = watchers.len(), "write applied");
        for (_, callback) in watchers {
            callback(batch.clone());
        }
    }

    pub fn insert(&self, triples: Vec<Triple>) { self.write(WriteBatch::inserts(triples)); }

    fn snapshot_stream(triples: Vec<Triple>) -> TripleStream { stream::iter(triples.into_iter().map(Ok)).boxed() }
}

struct MemoryWriteGuard {
    id: u64,
    inner: Weak<Inner>,
}

impl WriteGuard for MemoryWriteGuard {}

impl Drop for MemoryWriteGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.watchers.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

fn in_range(triple: &Triple, range: &RangeQuery) -> bool {
    use std::cmp::Ordering as O;
    let value = &triple.value;
    if let Some(bound) = &range.gt {
        if compare(value, bound) != O::Greater {
            return false;
        }
    }
    if let Some(bound) = &range.gte {
        if compare(value, bound) == O::Less {
            return false;
        }
    }
    if let Some(bound) = &range.lt {
        if compare(value, bound) != O::Less {
            return false;
        }
    }
    if let Some(bound) = &range.lte {
        if compare(value, bound) == O::Greater {
            return false;
        }
    }
    let keyed = (value, &triple.entity_id);
    if let Some(cursor) = &range.gt_cursor {
        if compare_keyed(keyed, (&cursor.value, &cursor.entity_id)) != O::Greater {
            return false;
        }
    }
    if let Some(cursor) = &range.gte_cursor {
        if compare_keyed(keyed, (&cursor.value, &cursor.entity_id)) == O::Less {
            return false;
        }
    }
    if let Some(cursor) = &range.lt_cursor {
        if compare_keyed(keyed, (&cursor.value, &cursor.entity_id)) != O::Less {
            return false;
        }
    }
    if let Some(cursor) = &range.lte_cursor {
        if compare_keyed(keyed, (&cursor.value, &cursor.entity_id)) == O::Greater {
            return false;
        }
    }
    true
}

#[async_trait]
impl TripleStoreApi for MemoryTripleStore {
    async fn find_by_ave(&self, key: &[String], value: Option<&Value>) -> Result<TripleStream, StorageError> {
        let state = self.0.state.read().unwrap();
        let matches: Vec<Triple> = state
            .ave
            .range(key_floor(key)..key_ceiling(key))
            .map(|(_, triple)| triple)
            .filter(|triple| value.is_none() || value.map_or(false, |v| compare(&triple.value, v) == std::cmp::Ordering::Equal))
            .cloned()
            .collect();
        Ok(Self::snapshot_stream(matches))
    }

    async fn find_values_in_range(&self, key: &[String], range: &RangeQuery) -> Result<TripleStream, StorageError> {
        let state = self.0.state.read().unwrap();
        let mut matches: Vec<Triple> =
            state.ave.range(key_floor(key)..key_ceiling(key)).map(|(_, triple)| triple).filter(|t| in_range(t, range)).cloned().collect();
        if range.direction == ScanDirection::Desc {
            matches.reverse();
        }
        Ok(Self::snapshot_stream(matches))
    }

    async fn find_by_entity(&self, entity_id: &EntityId) -> Result<TripleStream, StorageError> {
        let state = self.0.state.read().unwrap();
        Ok(Self::snapshot_stream(state.by_entity.get(entity_id).cloned().unwrap_or_default()))
    }

    async fn find_by_client_timestamp(&self, client_id: &str, cmp: Cmp, timestamp: &Timestamp) -> Result<TripleStream, StorageError> {
        let state = self.0.state.read().unwrap();
        let mut matches: Vec<Triple> = state
            .by_entity
            .values()
            .flatten()
            .filter(|t| t.timestamp.client_id == client_id)
            .filter(|t| match cmp {
                Cmp::Gt => t.timestamp > *timestamp,
                Cmp::Gte => t.timestamp >= *timestamp,
                Cmp::Lt => t.timestamp < *timestamp,
                Cmp::Lte => t.timestamp <= *timestamp,
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(Self::snapshot_stream(matches))
    }

    async fn find_all_client_ids(&self) -> Result<BTreeSet<String>, StorageError> {
        let state = self.0.state.read().unwrap();
        Ok(state.by_entity.values().flatten().map(|t| t.timestamp.client_id.clone()).collect())
    }

    fn on_write(&self, callback: WriteCallback) -> Box<dyn WriteGuard> {
        let id = self.0.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.0.watchers.lock().unwrap().push((id, callback));
        Box::new(MemoryWriteGuard { id, inner: Arc::downgrade(&self.0) })
    }
}
