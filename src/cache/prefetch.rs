//! Best-effort warming of entries the user is likely to need next.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use super::store::CacheStore;
use super::traits::CacheKey;
use crate::config::PrefetchConfig;
use crate::network::{LinkQuality, NetworkMonitor};

/// Source of query results for background fetches.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
  async fn fetch(&self, key: &CacheKey) -> Result<Value>;
}

/// Predicts keys worth warming from one recently accessed key.
pub trait PrefetchRule: Send + Sync {
  fn predict(&self, recent: &CacheKey, store: &CacheStore) -> Vec<CacheKey>;
}

/// After a list `[resource, "list", ..]` is viewed, warm
/// `[resource, "detail", id]` for its first few items.
///
/// Only works when the cached list is a JSON array of objects with an `id`.
#[derive(Debug, Clone)]
pub struct ListToDetail {
  pub limit: usize,
}

impl PrefetchRule for ListToDetail {
  fn predict(&self, recent: &CacheKey, store: &CacheStore) -> Vec<CacheKey> {
    let parts = recent.parts();
    if parts.len() < 2 || parts[1] != "list" {
      return Vec::new();
    }

    let Some(Value::Array(items)) = store.get(recent).and_then(|e| e.data) else {
      return Vec::new();
    };

    items
      .iter()
      .filter_map(|item| match item.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
      })
      .take(self.limit)
      .map(|id| CacheKey::new([parts[0].clone(), "detail".to_string(), id]))
      .collect()
  }
}

/// After page `n` of a paginated list `[resource, "list", .., "page", n]`,
/// warm page `n + 1`.
#[derive(Debug, Clone, Default)]
pub struct NextPage;

impl PrefetchRule for NextPage {
  fn predict(&self, recent: &CacheKey, _store: &CacheStore) -> Vec<CacheKey> {
    let parts = recent.parts();
    let n = parts.len();
    if n < 4 || parts[1] != "list" || parts[n - 2] != "page" {
      return Vec::new();
    }
    let Ok(page) = parts[n - 1].parse::<u64>() else {
      return Vec::new();
    };

    let mut next = parts[..n - 1].to_vec();
    next.push((page + 1).to_string());
    vec![CacheKey::from(next)]
  }
}

/// Keys scheduled by one prefetch call and the tasks fetching them.
///
/// Dropping the batch leaves the fetches running in the background.
#[derive(Debug, Default)]
pub struct PrefetchBatch {
  keys: Vec<CacheKey>,
  handles: Vec<JoinHandle<()>>,
}

impl PrefetchBatch {
  pub fn keys(&self) -> &[CacheKey] {
    &self.keys
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  /// Wait until every scheduled fetch has settled.
  pub async fn join(self) {
    for handle in self.handles {
      let _ = handle.await;
    }
  }
}

/// Removes a key from the in-flight set when its fetch task ends, even if the
/// task is aborted.
struct InFlightGuard {
  in_flight: Arc<Mutex<HashSet<CacheKey>>>,
  key: CacheKey,
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self.in_flight.lock().remove(&self.key);
  }
}

pub struct Prefetcher {
  store: Arc<CacheStore>,
  network: Arc<NetworkMonitor>,
  fetcher: Arc<dyn QueryFetcher>,
  rules: Vec<Box<dyn PrefetchRule>>,
  config: PrefetchConfig,
  in_flight: Arc<Mutex<HashSet<CacheKey>>>,
}

impl Prefetcher {
  /// Create a prefetcher with the built-in rule set.
  pub fn new(
    store: Arc<CacheStore>,
    network: Arc<NetworkMonitor>,
    fetcher: Arc<dyn QueryFetcher>,
    config: PrefetchConfig,
  ) -> Self {
    let rules: Vec<Box<dyn PrefetchRule>> = vec![
      Box::new(ListToDetail {
        limit: config.detail_limit,
      }),
      Box::new(NextPage),
    ];
    Self {
      store,
      network,
      fetcher,
      rules,
      config,
      in_flight: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  /// Predicted keys for a navigation history (oldest first), newest source
  /// first, without duplicates.
  pub fn predict(&self, recent: &[CacheKey]) -> Vec<CacheKey> {
    let start = recent.len().saturating_sub(self.config.history_limit);
    let mut seen = HashSet::new();
    let mut predicted = Vec::new();

    for key in recent[start..].iter().rev() {
      for rule in &self.rules {
        for candidate in rule.predict(key, &self.store) {
          if seen.insert(candidate.clone()) {
            predicted.push(candidate);
          }
        }
      }
    }
    predicted
  }

  /// Warm likely-next entries in the background without blocking the caller.
  ///
  /// Nothing is scheduled when offline, on a slow link, or outside a tokio
  /// runtime. Fresh entries and keys already being fetched are skipped, and
  /// predictions beyond the in-flight budget are dropped. Failures are
  /// discarded.
  pub fn prefetch_from_pattern(&self, recent: &[CacheKey]) -> PrefetchBatch {
    let mut batch = PrefetchBatch::default();

    if !self.config.enabled {
      return batch;
    }
    if !self.network.is_online() || self.network.link_quality() == LinkQuality::Slow {
      debug!("prefetch: skipped, network unavailable or slow");
      return batch;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!("prefetch: skipped, no runtime");
      return batch;
    };

    for key in self.predict(recent) {
      // Read before the freshness check so any later write wins over the fetch
      let version = self.store.version(&key);
      if let Some(entry) = self.store.get(&key) {
        if !self.store.is_stale(&entry) {
          continue;
        }
      }

      let guard = {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(&key) {
          continue;
        }
        if in_flight.len() >= self.config.max_in_flight {
          debug!(%key, "prefetch: in-flight budget exhausted, skipping");
          continue;
        }
        in_flight.insert(key.clone());
        InFlightGuard {
          in_flight: Arc::clone(&self.in_flight),
          key: key.clone(),
        }
      };

      let store = Arc::clone(&self.store);
      let fetcher = Arc::clone(&self.fetcher);
      let task_key = key.clone();
      let handle = runtime.spawn(async move {
        let _guard = guard;
        match fetcher.fetch(&task_key).await {
          Ok(data) => {
            if store.set_if_version(task_key.clone(), data, version) {
              debug!(key = %task_key, "prefetch: warmed");
            } else {
              debug!(key = %task_key, "prefetch: entry changed while fetching, discarded");
            }
          }
          Err(e) => debug!(key = %task_key, "prefetch: failed: {}", e),
        }
      });

      batch.keys.push(key);
      batch.handles.push(handle);
    }

    batch
  }
}

impl std::fmt::Debug for Prefetcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Prefetcher")
      .field("config", &self.config)
      .field("in_flight", &self.in_flight.lock().len())
      .finish_non_exhaustive()
  }
}
