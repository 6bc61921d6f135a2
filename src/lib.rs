//! Offline-first data layer: a persisted mutation queue that drains while the
//! network is up, an optimistic query cache with rollback, and pressure-driven
//! pruning and prefetching.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod layer;
pub mod logging;
pub mod network;
pub mod optimistic;
pub mod queue;
pub mod storage;

pub use cache::{CacheEntry, CacheKey, CacheStore, QueryFetcher};
pub use config::Config;
pub use error::QueueError;
pub use event::{EventBus, LayerEvent};
pub use layer::OfflineLayer;
pub use network::{LinkQuality, NetworkMonitor};
pub use optimistic::{OptimisticOptions, OptimisticUpdateCoordinator};
pub use queue::{EnqueueOptions, PendingRequest, Priority, RequestId, RequestQueue};
pub use storage::{MemoryStorage, NoopStorage, SqliteStorage, Storage};
