//! The triple-store index API the engine consumes.
//!
//! The store itself (persistence, index maintenance) is an external
//! collaborator. Every method is a suspension point; a `TripleStoreApi`
//! handed to `fetch` is expected to be bound to a consistent snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use trellis_proto::{EntityId, Timestamp, Triple, Value, WriteBatch};
use trellis_query::Cursor;

pub type TripleStream = BoxStream<'static, Result<Triple, StorageError>>;

pub type WriteCallback = Arc<dyn Fn(WriteBatch) + Send + Sync>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("store closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Bounds for an ordered attribute scan. Value bounds compare the indexed
/// value alone; cursor bounds compare the `(value, entity_id)` pair, which is
/// what makes pagination restartable mid-tie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeQuery {
    pub direction: ScanDirection,
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
    pub gt_cursor: Option<Cursor>,
    pub gte_cursor: Option<Cursor>,
    pub lt_cursor: Option<Cursor>,
    pub lte_cursor: Option<Cursor>,
}

impl RangeQuery {
    pub fn direction(direction: ScanDirection) -> Self { Self { direction, ..Default::default() } }

    pub fn gt(mut self, value: Value) -> Self {
        self.gt = Some(value);
        self
    }
    pub fn gte(mut self, value: Value) -> Self {
        self.gte = Some(value);
        self
    }
    pub fn lt(mut self, value: Value) -> Self {
        self.lt = Some(value);
        self
    }
    pub fn lte(mut self, value: Value) -> Self {
        self.lte = Some(value);
        self
    }
}

/// Detaches the write callback when dropped.
pub trait WriteGuard: Send {}

#[async_trait]
pub trait TripleStoreApi: Send + Sync {
    /// Attribute-value-entity exact lookup. `key` is `[collection, path..]`;
    /// `None` matches every value under the key.
    async fn find_by_ave(&self, key: &[String], value: Option<&Value>) -> Result<TripleStream, StorageError>;

    /// Ordered scan of an attribute index with value and cursor bounds.
    async fn find_values_in_range(&self, key: &[String], range: &RangeQuery) -> Result<TripleStream, StorageError>;

    /// Every triple version recorded for an entity.
    async fn find_by_entity(&self, entity_id: &EntityId) -> Result<TripleStream, StorageError>;

    /// Triples from one client relative to a timestamp.
    async fn find_by_client_timestamp(&self, client_id: &str, cmp: Cmp, timestamp: &Timestamp) -> Result<TripleStream, StorageError>;

    async fn find_all_client_ids(&self) -> Result<BTreeSet<String>, StorageError>;

    /// Register a write observer. The callback fires once per source
    /// transaction, after the batch is applied.
    fn on_write(&self, callback: WriteCallback) -> Box<dyn WriteGuard>;
}
