//! Keyed store of query results with staleness bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::traits::{CacheEntry, CacheKey, CacheResult};
use crate::storage::Storage;

#[derive(Debug, Clone)]
struct Stored {
  data: Option<Value>,
  fetched_at: DateTime<Utc>,
  is_invalidated: bool,
  /// Bumped on every write that changes data
  version: u64,
}

#[derive(Default)]
struct Inner {
  entries: BTreeMap<CacheKey, Stored>,
  /// Live observers per key; may name keys with no entry yet
  observers: HashMap<CacheKey, usize>,
  next_version: u64,
}

impl Inner {
  fn entry(&self, key: &CacheKey, stored: &Stored) -> CacheEntry {
    CacheEntry {
      key: key.clone(),
      data: stored.data.clone(),
      fetched_at: stored.fetched_at,
      is_active: self.observers.get(key).copied().unwrap_or(0) > 0,
      is_invalidated: stored.is_invalidated,
    }
  }

  fn snapshot(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.entries.get(key).map(|stored| self.entry(key, stored))
  }

  fn write(
    &mut self,
    key: CacheKey,
    data: Option<Value>,
    fetched_at: DateTime<Utc>,
    is_invalidated: bool,
  ) {
    self.next_version += 1;
    let version = self.next_version;
    self.entries.insert(
      key,
      Stored {
        data,
        fetched_at,
        is_invalidated,
        version,
      },
    );
  }
}

/// The single shared cache. Every mutation goes through this API and happens
/// in one critical section, so readers only ever see whole values.
pub struct CacheStore {
  inner: Mutex<Inner>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl CacheStore {
  pub fn new(stale_time: Duration) -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      stale_time,
    }
  }

  /// Deep copy of the entry at `key`.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.inner.lock().snapshot(key)
  }

  /// Write counter of the entry at `key`. Any later write changes it.
  pub fn version(&self, key: &CacheKey) -> Option<u64> {
    self.inner.lock().entries.get(key).map(|stored| stored.version)
  }

  /// Typed view of the data at `key`.
  pub fn get_data<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
    let data = self.get(key).and_then(|entry| entry.data);
    data
      .map(serde_json::from_value)
      .transpose()
      .map_err(|e| eyre!("Failed to decode cache entry {}: {}", key, e))
  }

  /// Create or replace the entry, refreshing `fetched_at` and clearing any
  /// invalidation.
  pub fn set(&self, key: CacheKey, data: Value) {
    self.set_at(key, Some(data), Utc::now());
  }

  /// Typed counterpart of [`set`](Self::set).
  pub fn set_data<T: Serialize>(&self, key: CacheKey, data: &T) -> Result<()> {
    let value =
      serde_json::to_value(data).map_err(|e| eyre!("Failed to encode cache entry {}: {}", key, e))?;
    self.set(key, value);
    Ok(())
  }

  /// Create or replace the entry with an explicit population time.
  pub fn set_at(&self, key: CacheKey, data: Option<Value>, fetched_at: DateTime<Utc>) {
    self.inner.lock().write(key, data, fetched_at, false);
  }

  /// Store `data` only if the entry has not been written since `expected` was
  /// read from [`version`](Self::version) (`None`: the entry did not exist).
  pub fn set_if_version(&self, key: CacheKey, data: Value, expected: Option<u64>) -> bool {
    let mut inner = self.inner.lock();
    let current = inner.entries.get(&key).map(|stored| stored.version);
    if current != expected {
      return false;
    }
    inner.write(key, Some(data), Utc::now(), false);
    true
  }

  /// Compute the new value from the current one and store it, all under one
  /// lock. Returns the entry as it was before the write.
  ///
  /// Unlike [`update`](Self::update) this creates the entry when absent.
  pub fn set_with<F>(&self, key: CacheKey, f: F) -> Option<CacheEntry>
  where
    F: FnOnce(Option<&Value>) -> Value,
  {
    let mut inner = self.inner.lock();
    let previous = inner.snapshot(&key);
    let data = f(previous.as_ref().and_then(|entry| entry.data.as_ref()));
    inner.write(key, Some(data), Utc::now(), false);
    previous
  }

  /// Transform existing data in place. No-op (returning false) when the entry
  /// is absent or holds no data.
  pub fn update<F>(&self, key: &CacheKey, f: F) -> bool
  where
    F: FnOnce(&Value) -> Value,
  {
    let mut inner = self.inner.lock();
    inner.next_version += 1;
    let version = inner.next_version;
    match inner.entries.get_mut(key) {
      Some(stored) => match &mut stored.data {
        Some(data) => {
          *data = f(data);
          stored.version = version;
          true
        }
        None => false,
      },
      None => false,
    }
  }

  /// Mark every entry matching `filter` for refetch. Data stays readable.
  pub fn invalidate(&self, filter: &CacheKey) -> usize {
    let mut inner = self.inner.lock();
    let mut count = 0;
    for (key, stored) in inner.entries.iter_mut() {
      if key.matches(filter) {
        stored.is_invalidated = true;
        count += 1;
      }
    }
    debug!(%filter, count, "cache: invalidated");
    count
  }

  /// Delete every entry matching `filter`.
  pub fn remove(&self, filter: &CacheKey) -> usize {
    let mut inner = self.inner.lock();
    let before = inner.entries.len();
    inner.entries.retain(|key, _| !key.matches(filter));
    let count = before - inner.entries.len();
    debug!(%filter, count, "cache: removed");
    count
  }

  /// Delete the entry at exactly `key`, leaving longer keys beneath it.
  pub fn remove_exact(&self, key: &CacheKey) -> bool {
    self.inner.lock().entries.remove(key).is_some()
  }

  /// Put `key` back exactly as `snapshot` describes it: the same data,
  /// timestamp and invalidation flag, or no entry at all.
  pub fn restore(&self, key: &CacheKey, snapshot: Option<CacheEntry>) {
    let mut inner = self.inner.lock();
    match snapshot {
      Some(entry) => {
        inner.write(key.clone(), entry.data, entry.fetched_at, entry.is_invalidated);
      }
      None => {
        inner.entries.remove(key);
      }
    }
  }

  /// Deep copies of all entries accepted by `predicate`, in key order.
  pub fn find_all<P>(&self, predicate: P) -> Vec<CacheEntry>
  where
    P: Fn(&CacheEntry) -> bool,
  {
    let inner = self.inner.lock();
    inner
      .entries
      .iter()
      .map(|(key, stored)| inner.entry(key, stored))
      .filter(|entry| predicate(entry))
      .collect()
  }

  /// Mark `key` as observed for as long as the guard lives.
  ///
  /// The key need not exist yet; an entry created later starts out active.
  pub fn observe(self: &Arc<Self>, key: CacheKey) -> ObserverGuard {
    *self.inner.lock().observers.entry(key.clone()).or_insert(0) += 1;
    ObserverGuard {
      store: Arc::clone(self),
      key,
    }
  }

  fn release(&self, key: &CacheKey) {
    let mut inner = self.inner.lock();
    if let Some(count) = inner.observers.get_mut(key) {
      *count = count.saturating_sub(1);
      if *count == 0 {
        inner.observers.remove(key);
      }
    }
  }

  /// Whether an entry should be refetched before being trusted.
  pub fn is_stale(&self, entry: &CacheEntry) -> bool {
    entry.is_invalidated || entry.data.is_none() || Utc::now() - entry.fetched_at > self.stale_time
  }

  /// Read with a cache-first strategy.
  ///
  /// 1. Fresh cached data is returned immediately
  /// 2. Stale or missing data is fetched
  /// 3. If that fetch fails, stale data is served (offline mode)
  /// 4. Fetched data replaces the entry
  pub async fn fetch<F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<CacheResult<Value>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    let cached = self.get(key);

    if let Some(entry) = &cached {
      if !self.is_stale(entry) {
        if let Some(data) = &entry.data {
          return Ok(CacheResult::from_cache(data.clone(), entry.fetched_at));
        }
      }
    }

    match fetcher().await {
      Ok(data) => {
        self.set(key.clone(), data.clone());
        Ok(CacheResult::from_network(data))
      }
      Err(e) => match cached {
        Some(CacheEntry {
          data: Some(data),
          fetched_at,
          ..
        }) => {
          debug!(%key, "cache: refetch failed, serving stale data: {}", e);
          Ok(CacheResult::offline(data, fetched_at))
        }
        _ => Err(e),
      },
    }
  }

  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop every entry. Observers stay registered.
  pub fn clear(&self) {
    self.inner.lock().entries.clear();
  }

  /// Write all entries to `storage`, replacing the previous snapshot.
  pub fn dehydrate(&self, storage: &dyn Storage) -> Result<usize> {
    let entries = self.find_all(|_| true);
    storage.save_entries(&entries)?;
    Ok(entries.len())
  }

  /// Load a snapshot written by [`dehydrate`](Self::dehydrate). Entries already
  /// in memory win over stored ones.
  pub fn hydrate(&self, storage: &dyn Storage) -> Result<usize> {
    let entries = storage.load_entries()?;
    let mut inner = self.inner.lock();
    let mut count = 0;
    for entry in entries {
      if inner.entries.contains_key(&entry.key) {
        continue;
      }
      inner.write(entry.key, entry.data, entry.fetched_at, entry.is_invalidated);
      count += 1;
    }
    Ok(count)
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("entries", &self.len())
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}

/// Keeps a key active until dropped.
#[derive(Debug)]
pub struct ObserverGuard {
  store: Arc<CacheStore>,
  key: CacheKey,
}

impl ObserverGuard {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }
}

impl Drop for ObserverGuard {
  fn drop(&mut self) {
    self.store.release(&self.key);
  }
}
