//! The offline data layer as one owned context.

use std::sync::Arc;

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CachePruner, CacheStore, PrefetchBatch, Prefetcher, QueryFetcher};
use crate::config::Config;
use crate::event::{EventBus, LayerEvent};
use crate::network::NetworkMonitor;
use crate::optimistic::OptimisticUpdateCoordinator;
use crate::queue::RequestQueue;
use crate::storage::{SqliteStorage, Storage};

/// Owns every component of the layer. Construct one at startup and share it
/// by reference; call [`shutdown`](Self::shutdown) before dropping it.
pub struct OfflineLayer {
  config: Config,
  storage: Arc<dyn Storage>,
  events: EventBus,
  network: Arc<NetworkMonitor>,
  cache: Arc<CacheStore>,
  queue: Arc<RequestQueue>,
  coordinator: OptimisticUpdateCoordinator,
  pruner: CachePruner,
  prefetcher: Prefetcher,
  probe: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineLayer {
  /// Wire up all components over `storage`.
  ///
  /// With `cache.persist` set, the cache is hydrated from the last snapshot.
  /// A snapshot that fails to load is logged and ignored.
  pub fn new(
    config: Config,
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn QueryFetcher>,
  ) -> Result<Self> {
    config.validate()?;

    let events = EventBus::default();
    let network = Arc::new(NetworkMonitor::new(config.network.clone(), events.clone()));

    let stale_time = Duration::seconds(config.cache.stale_time_secs as i64);
    let cache = Arc::new(CacheStore::new(stale_time));
    if config.cache.persist {
      match cache.hydrate(storage.as_ref()) {
        Ok(count) => info!(count, "layer: hydrated cache from storage"),
        Err(e) => warn!("layer: failed to hydrate cache: {}", e),
      }
    }

    let queue = RequestQueue::new(
      config.queue.clone(),
      Arc::clone(&network),
      Arc::clone(&storage),
      events.clone(),
    );
    let coordinator = OptimisticUpdateCoordinator::new(Arc::clone(&cache), Arc::clone(&queue));
    let pruner = CachePruner::new(Arc::clone(&cache), config.cache.prune_fraction, events.clone());
    let prefetcher = Prefetcher::new(
      Arc::clone(&cache),
      Arc::clone(&network),
      fetcher,
      config.prefetch.clone(),
    );

    Ok(Self {
      config,
      storage,
      events,
      network,
      cache,
      queue,
      coordinator,
      pruner,
      prefetcher,
      probe: Mutex::new(None),
    })
  }

  /// Open the layer over the SQLite database at the configured path.
  pub fn open(config: Config, fetcher: Arc<dyn QueryFetcher>) -> Result<Self> {
    let path = config.storage_path()?;
    let storage = SqliteStorage::open(&path)?;
    info!(path = %path.display(), "layer: opened storage");
    Self::new(config, Arc::new(storage), fetcher)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn storage(&self) -> &Arc<dyn Storage> {
    &self.storage
  }

  pub fn events(&self) -> &EventBus {
    &self.events
  }

  pub fn subscribe(&self) -> broadcast::Receiver<LayerEvent> {
    self.events.subscribe()
  }

  pub fn network(&self) -> &Arc<NetworkMonitor> {
    &self.network
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<RequestQueue> {
    &self.queue
  }

  pub fn coordinator(&self) -> &OptimisticUpdateCoordinator {
    &self.coordinator
  }

  pub fn pruner(&self) -> &CachePruner {
    &self.pruner
  }

  /// Warm the cache from a navigation history.
  pub fn prefetch(&self, recent: &[crate::cache::CacheKey]) -> PrefetchBatch {
    self.prefetcher.prefetch_from_pattern(recent)
  }

  /// Start the periodic connectivity probe. Returns false when no probe URL
  /// is configured or the probe is already running. Must be called from
  /// within a tokio runtime.
  pub fn start_probe(&self) -> Result<bool> {
    if self.config.network.probe_url.is_none() {
      return Ok(false);
    }
    let mut probe = self.probe.lock();
    if probe.is_some() {
      return Ok(false);
    }

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build probe client: {}", e))?;
    *probe = Some(self.network.spawn_probe_loop(client));
    Ok(true)
  }

  /// Forget all cached data, in memory and in the persisted snapshot.
  pub fn logout(&self) {
    let count = self.cache.len();
    self.cache.clear();
    if self.config.cache.persist {
      if let Err(e) = self.storage.save_entries(&[]) {
        warn!("layer: failed to clear persisted cache: {}", e);
      }
    }
    info!(count, "layer: cleared cache on logout");
  }

  /// Stop background work and reject pending requests with
  /// [`QueueError::Shutdown`](crate::error::QueueError::Shutdown).
  ///
  /// Optimistic updates left without an outcome are rolled back before the
  /// cache is written out, so the snapshot never holds a speculative value.
  /// The in-memory cache is cleared last.
  pub fn shutdown(&self) {
    if let Some(handle) = self.probe.lock().take() {
      handle.abort();
    }

    self.queue.shutdown();
    self.coordinator.roll_back_unsettled();

    if self.config.cache.persist {
      match self.cache.dehydrate(self.storage.as_ref()) {
        Ok(count) => info!(count, "layer: persisted cache snapshot"),
        Err(e) => warn!("layer: failed to persist cache: {}", e),
      }
    }
    self.cache.clear();
    info!("layer: shut down");
  }
}

impl std::fmt::Debug for OfflineLayer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OfflineLayer")
      .field("network", &self.network)
      .field("cache", &self.cache)
      .field("queue", &self.queue)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheKey;
  use crate::error::QueueError;
  use crate::optimistic::OptimisticOptions;
  use crate::queue::EnqueueOptions;
  use crate::storage::MemoryStorage;
  use async_trait::async_trait;
  use serde_json::{json, Value};
  use tempfile::TempDir;

  struct StaticFetcher;

  #[async_trait]
  impl QueryFetcher for StaticFetcher {
    async fn fetch(&self, key: &CacheKey) -> Result<Value> {
      Ok(json!({ "key": key.to_string() }))
    }
  }

  fn layer_with(storage: Arc<dyn Storage>) -> OfflineLayer {
    OfflineLayer::new(Config::default(), storage, Arc::new(StaticFetcher)).unwrap()
  }

  #[tokio::test]
  async fn test_queued_mutation_through_layer() {
    let layer = layer_with(Arc::new(MemoryStorage::new()));
    let key = CacheKey::from(["todos", "1"]);
    layer.cache().set(key.clone(), json!({"title": "a"}));

    let result = layer
      .coordinator()
      .optimistic_update(
        key.clone(),
        |_| json!({"title": "b"}),
        || async { Ok::<_, color_eyre::Report>(7) },
        OptimisticOptions::default(),
      )
      .await;

    assert_eq!(result.unwrap(), 7);
    let entry = layer.cache().get(&key).unwrap();
    assert_eq!(entry.data, Some(json!({"title": "b"})));
    assert!(entry.is_invalidated);
    assert_eq!(layer.queue().stats().succeeded, 1);
  }

  #[tokio::test]
  async fn test_shutdown_rejects_pending_and_persists_cache() {
    let storage = Arc::new(MemoryStorage::new());
    let layer = layer_with(Arc::clone(&storage) as Arc<dyn Storage>);
    layer.cache().set(CacheKey::from(["a"]), json!(1));
    layer.network().set_online(false);

    let pending = layer.queue().enqueue(
      || async { Ok::<_, color_eyre::Report>(()) },
      EnqueueOptions::default(),
    );
    layer.shutdown();

    assert!(matches!(pending.await, Err(QueueError::Shutdown(_))));
    assert!(layer.cache().is_empty());
    assert_eq!(storage.load_entries().unwrap().len(), 1);
    assert!(storage.load_queue().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_shutdown_persists_pre_mutation_value() {
    let storage = Arc::new(MemoryStorage::new());
    let layer = Arc::new(layer_with(Arc::clone(&storage) as Arc<dyn Storage>));
    let key = CacheKey::from(["todos", "1"]);
    layer.cache().set(key.clone(), json!("old"));
    layer.network().set_online(false);

    let task = tokio::spawn({
      let layer = Arc::clone(&layer);
      let key = key.clone();
      async move {
        layer
          .coordinator()
          .optimistic_update(
            key,
            |_| json!("new"),
            || async { Ok::<_, color_eyre::Report>(()) },
            OptimisticOptions::default(),
          )
          .await
      }
    });
    tokio::task::yield_now().await;
    assert_eq!(layer.cache().get(&key).unwrap().data, Some(json!("new")));
    assert_eq!(layer.coordinator().unsettled(), 1);

    layer.shutdown();

    let persisted = storage.load_entries().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].data, Some(json!("old")));

    assert!(matches!(task.await.unwrap(), Err(QueueError::Shutdown(_))));
    assert!(layer.cache().is_empty());
    assert_eq!(layer.coordinator().unsettled(), 0);
  }

  #[tokio::test]
  async fn test_restart_hydrates_cache_from_sqlite() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.path = Some(dir.path().join("state.db"));

    let first = OfflineLayer::open(config.clone(), Arc::new(StaticFetcher)).unwrap();
    first.cache().set(CacheKey::from(["templates", "public"]), json!(["x"]));
    first.shutdown();
    drop(first);

    let second = OfflineLayer::open(config, Arc::new(StaticFetcher)).unwrap();
    let entry = second
      .cache()
      .get(&CacheKey::from(["templates", "public"]))
      .unwrap();
    assert_eq!(entry.data, Some(json!(["x"])));
  }

  #[tokio::test]
  async fn test_logout_clears_memory_and_snapshot() {
    let storage = Arc::new(MemoryStorage::new());
    let layer = layer_with(Arc::clone(&storage) as Arc<dyn Storage>);
    layer.cache().set(CacheKey::from(["a"]), json!(1));
    layer.cache().dehydrate(storage.as_ref()).unwrap();

    layer.logout();

    assert!(layer.cache().is_empty());
    assert!(storage.load_entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_prefetch_populates_details() {
    let layer = layer_with(Arc::new(MemoryStorage::new()));
    let list = CacheKey::from(["todos", "list"]);
    layer.cache().set(list.clone(), json!([{"id": 1}, {"id": "b"}]));

    let batch = layer.prefetch(&[list]);
    assert_eq!(batch.keys().len(), 2);
    batch.join().await;

    let detail = layer.cache().get(&CacheKey::from(["todos", "detail", "1"])).unwrap();
    assert_eq!(detail.data, Some(json!({"key": "[todos, detail, 1]"})));
  }

  #[test]
  fn test_start_probe_without_url_is_noop() {
    let layer = layer_with(Arc::new(MemoryStorage::new()));
    assert!(!layer.start_probe().unwrap());
  }

  #[test]
  fn test_rejects_invalid_config() {
    let mut config = Config::default();
    config.cache.prune_fraction = 0.0;
    let result = OfflineLayer::new(config, Arc::new(MemoryStorage::new()), Arc::new(StaticFetcher));
    assert!(result.is_err());
  }
}
