//! Public error types for the query engine.
//!
//! Synchronous validation errors fail the whole `fetch`; errors raised inside
//! a subscription callback are routed to the caller's `on_error` and never
//! tear down the subscription.

use thiserror::Error;

use crate::storage::StorageError;

/// Error type for retrieval operations.
///
/// Returned from: `Engine::fetch`, `fetch_one`, `fetch_delta_triples`,
/// `subscribe`.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// An include was not canonicalized before execution
    #[error("query not prepared: {0}")]
    QueryNotPrepared(String),

    /// Malformed statement or group
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A variable path resolves through a cardinality-many relation
    #[error("variable {var} traverses cardinality-many relation {relation}")]
    VariableRelationCardinality { var: String, relation: String },

    /// Schema lookup of a relation path failed
    #[error("unknown relation {path} on collection {collection}")]
    UnknownRelation { collection: String, path: String },

    /// Root-permutation reversal hit an operator with no inverse
    #[error("reverse operator error: {0}")]
    ReverseOperator(#[from] trellis_query::ReverseOperatorError),

    /// Materialization or planning saw a schema node it cannot handle
    #[error("invalid schema item at {path}: {reason}")]
    InvalidSchemaItem { path: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
