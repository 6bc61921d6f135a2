//! Query cache for data persistence and offline support.
//!
//! This module provides:
//! - A keyed store of query results with staleness bookkeeping
//! - Cache-first reads that serve stale data when the network fails
//! - Pressure-triggered eviction of inactive, old entries
//! - Background prefetching driven by navigation history

mod prefetch;
mod pruner;
mod store;
mod traits;

pub use prefetch::{ListToDetail, NextPage, PrefetchBatch, PrefetchRule, Prefetcher, QueryFetcher};
pub use pruner::CachePruner;
pub use store::{CacheStore, ObserverGuard};
pub use traits::{CacheEntry, CacheKey, CacheResult, CacheSource};
