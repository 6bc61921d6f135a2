//! Pressure-triggered eviction.

use std::sync::Arc;

use tracing::info;

use super::store::CacheStore;
use super::traits::CacheKey;
use crate::event::{EventBus, LayerEvent};

/// Evicts a fixed share of the cache when storage runs short.
///
/// The policy is deliberately simple rather than a true LRU: inactive entries
/// go before active ones, older before newer, and exactly
/// `floor(len * fraction)` entries are removed. When there are too few inactive
/// entries the cut spills into the oldest active ones.
#[derive(Debug)]
pub struct CachePruner {
  store: Arc<CacheStore>,
  fraction: f64,
  events: EventBus,
}

impl CachePruner {
  pub fn new(store: Arc<CacheStore>, fraction: f64, events: EventBus) -> Self {
    Self {
      store,
      fraction,
      events,
    }
  }

  /// Evict in response to a storage-quota signal. Returns the removed keys in
  /// eviction order.
  pub fn prune_on_pressure(&self) -> Vec<CacheKey> {
    let mut entries = self.store.find_all(|_| true);
    let total = entries.len();
    let cutoff = (total as f64 * self.fraction).floor() as usize;

    // Stable: equal timestamps keep key order
    entries.sort_by(|a, b| {
      a.is_active
        .cmp(&b.is_active)
        .then_with(|| a.fetched_at.cmp(&b.fetched_at))
    });

    let removed: Vec<CacheKey> = entries
      .into_iter()
      .take(cutoff)
      .map(|entry| entry.key)
      .collect();

    for key in &removed {
      self.store.remove_exact(key);
    }

    info!(total, removed = removed.len(), "cache: pruned under storage pressure");
    if !removed.is_empty() {
      self.events.publish(LayerEvent::CachePruned {
        removed: removed.clone(),
      });
    }
    removed
  }
}
