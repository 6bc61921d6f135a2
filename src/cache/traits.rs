//! Core types for the caching system.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Ordered tuple of strings naming a logical query, e.g. `["templates", "public"]`.
///
/// A key matches a filter key when the filter is a prefix of it, so
/// `["templates"]` matches every templates query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
  pub fn new<I, S>(parts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  pub fn parts(&self) -> &[String] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Whether `self` equals `filter` or extends it.
  pub fn matches(&self, filter: &CacheKey) -> bool {
    self.0.starts_with(&filter.0)
  }

  /// Return a copy with `part` appended.
  pub fn child(&self, part: impl Into<String>) -> Self {
    let mut parts = self.0.clone();
    parts.push(part.into());
    Self(parts)
  }

  /// Stable fixed-length identifier for storage.
  pub fn cache_hash(&self) -> String {
    // Length-prefix every part so ["a:b"] and ["a", "b"] never collide
    let mut hasher = Sha256::new();
    for part in &self.0 {
      hasher.update((part.len() as u64).to_le_bytes());
      hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}]", self.0.join(", "))
  }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for CacheKey {
  fn from(parts: [S; N]) -> Self {
    Self::new(parts)
  }
}

impl From<Vec<String>> for CacheKey {
  fn from(parts: Vec<String>) -> Self {
    Self(parts)
  }
}

/// A cached query result with staleness bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: CacheKey,
  /// Last known value; `None` when the entry exists without data
  pub data: Option<Value>,
  /// When the data was last populated
  pub fetched_at: DateTime<Utc>,
  /// At least one live observer holds this key
  pub is_active: bool,
  /// Marked for refetch; readers may still show `data` meanwhile
  pub is_invalidated: bool,
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Stale data served because the refetch failed or the layer is offline
  Offline,
}
