pub mod cache;
pub mod candidates;
pub mod collation;
pub mod delta;
pub mod engine;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod plan;
pub mod reactor;
pub mod schema;
pub mod sort;
pub mod storage;
pub mod vars;

pub use engine::{Engine, FetchOptions};
pub use error::RetrievalError;

pub use trellis_proto as proto;
pub use trellis_query as query;
