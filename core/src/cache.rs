//! Optional variable-aware cache for parameterized sub-queries.
//!
//! The cache is an external collaborator: the engine consults it before
//! computing a cachable sub-query and offers the computed set back
//! afterwards. Serializing concurrent builds per fingerprint is the cache's
//! concern, not the engine's.

use async_trait::async_trait;

use trellis_query::Query;

use crate::{
    engine::FetchOptions,
    fetch::FetchSet,
    vars::{FetchExecutionContext, SystemVars},
};

#[async_trait]
pub trait QueryCache: Send + Sync {
    fn can_cache_query(&self, query: &Query) -> bool;

    /// A cached `{results, triples}` set for this query under these
    /// variables, or `None` on miss.
    async fn resolve_from_cache(
        &self,
        query: &Query,
        system_vars: &SystemVars,
        ctx: &FetchExecutionContext,
        options: &FetchOptions,
    ) -> Option<FetchSet>;

    /// Offer a freshly computed set for retention.
    fn store(&self, query: &Query, system_vars: &SystemVars, set: &FetchSet);
}
