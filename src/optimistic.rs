//! Optimistic updates: change the cache now, confirm remotely, roll back on failure.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use color_eyre::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::error::QueueError;
use crate::queue::{run_with_timeout, EnqueueOptions, RequestQueue};

#[derive(Debug, Clone)]
pub struct OptimisticOptions {
  /// Invalidate the key after the remote effect succeeds so the next read
  /// refetches the authoritative value
  pub invalidate_on_success: bool,
  /// Route the operation through the request queue; otherwise run it once,
  /// directly, without retries
  pub queued: bool,
  pub enqueue: EnqueueOptions,
}

impl Default for OptimisticOptions {
  fn default() -> Self {
    Self {
      invalidate_on_success: true,
      queued: true,
      enqueue: EnqueueOptions::default(),
    }
  }
}

/// Rollback snapshots of updates whose remote effect has not settled yet.
#[derive(Debug, Default)]
struct Unsettled {
  next: u64,
  snapshots: BTreeMap<u64, (CacheKey, Option<CacheEntry>)>,
}

/// Removes an update's snapshot if its future is dropped before settling.
/// The speculative value stays; no rollback without a known outcome.
struct SnapshotGuard {
  unsettled: Arc<Mutex<Unsettled>>,
  token: u64,
}

impl SnapshotGuard {
  /// Claim the snapshot. `None` once [`roll_back_unsettled`] has restored it.
  ///
  /// [`roll_back_unsettled`]: OptimisticUpdateCoordinator::roll_back_unsettled
  fn take(&self) -> Option<Option<CacheEntry>> {
    self
      .unsettled
      .lock()
      .snapshots
      .remove(&self.token)
      .map(|(_, snapshot)| snapshot)
  }
}

impl Drop for SnapshotGuard {
  fn drop(&mut self) {
    self.unsettled.lock().snapshots.remove(&self.token);
  }
}

/// Coordinates the cache and the request queue for optimistic mutations.
#[derive(Debug, Clone)]
pub struct OptimisticUpdateCoordinator {
  cache: Arc<CacheStore>,
  queue: Arc<RequestQueue>,
  unsettled: Arc<Mutex<Unsettled>>,
}

impl OptimisticUpdateCoordinator {
  pub fn new(cache: Arc<CacheStore>, queue: Arc<RequestQueue>) -> Self {
    Self {
      cache,
      queue,
      unsettled: Arc::new(Mutex::new(Unsettled::default())),
    }
  }

  /// Number of updates still waiting for their remote outcome.
  pub fn unsettled(&self) -> usize {
    self.unsettled.lock().snapshots.len()
  }

  /// Restore every unsettled update's snapshot now, newest first, so each key
  /// ends at its oldest pre-mutation state. The owning calls still return
  /// their errors but no longer touch the cache.
  pub fn roll_back_unsettled(&self) -> usize {
    let snapshots = std::mem::take(&mut self.unsettled.lock().snapshots);
    let count = snapshots.len();
    for (_, (key, snapshot)) in snapshots.into_iter().rev() {
      self.cache.restore(&key, snapshot);
    }
    if count > 0 {
      info!(count, "optimistic: rolled back unsettled updates");
    }
    count
  }

  /// Apply `update_fn` to `key` immediately, then run `operation`.
  ///
  /// The speculative value is written in one step before any I/O starts, so
  /// readers see either the old value or the new one. On terminal failure the
  /// entry is put back exactly as it was (or removed if it did not exist) and
  /// the operation's error is returned.
  pub async fn optimistic_update<T, U, F, Fut>(
    &self,
    key: CacheKey,
    update_fn: U,
    operation: F,
    options: OptimisticOptions,
  ) -> std::result::Result<T, QueueError>
  where
    T: Send + 'static,
    U: FnOnce(Option<&Value>) -> Value,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    // Snapshot and speculative write happen under one store lock; the
    // unsettled lock is held across both so a rollback sees either none or both
    let guard = {
      let mut unsettled = self.unsettled.lock();
      let previous = self.cache.set_with(key.clone(), update_fn);
      unsettled.next += 1;
      let token = unsettled.next;
      unsettled.snapshots.insert(token, (key.clone(), previous));
      SnapshotGuard {
        unsettled: Arc::clone(&self.unsettled),
        token,
      }
    };
    debug!(%key, "optimistic: applied speculative value");

    let result = if options.queued {
      self.queue.enqueue(operation, options.enqueue).await
    } else {
      self.run_direct(operation, options.enqueue).await
    };

    match result {
      Ok(value) => {
        if guard.take().is_some() && options.invalidate_on_success {
          self.cache.invalidate(&key);
        }
        Ok(value)
      }
      Err(e) => {
        match guard.take() {
          Some(previous) => {
            warn!(%key, "optimistic: rolling back after failure: {}", e);
            self.cache.restore(&key, previous);
          }
          None => debug!(%key, "optimistic: already rolled back: {}", e),
        }
        Err(e)
      }
    }
  }

  /// Single attempt outside the queue, still bounded by the timeout and
  /// cancellation in `options`.
  async fn run_direct<T, F, Fut>(
    &self,
    mut operation: F,
    options: EnqueueOptions,
  ) -> std::result::Result<T, QueueError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let id = self.queue.next_id();
    let timeout = options.timeout.or(self.queue.default_timeout());
    let cancel = options.cancel.unwrap_or_default();

    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(QueueError::Cancelled(id)),
      result = run_with_timeout(operation(), timeout) => match result {
        Some(Ok(value)) => Ok(value),
        Some(Err(error)) => Err(QueueError::Operation { id, attempts: 1, error }),
        None => Err(QueueError::TimedOut { id, timeout: timeout.unwrap_or_default() }),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{NetworkConfig, QueueConfig};
  use crate::event::EventBus;
  use crate::network::NetworkMonitor;
  use crate::storage::{NoopStorage, Storage};
  use chrono::Duration;
  use color_eyre::eyre::eyre;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio_util::sync::CancellationToken;

  struct Setup {
    cache: Arc<CacheStore>,
    network: Arc<NetworkMonitor>,
    coordinator: OptimisticUpdateCoordinator,
  }

  fn setup() -> Setup {
    let events = EventBus::default();
    let cache = Arc::new(CacheStore::new(Duration::minutes(5)));
    let network = Arc::new(NetworkMonitor::new(NetworkConfig::default(), events.clone()));
    let queue = RequestQueue::new(
      QueueConfig::default(),
      Arc::clone(&network),
      Arc::new(NoopStorage) as Arc<dyn Storage>,
      events,
    );
    let coordinator = OptimisticUpdateCoordinator::new(Arc::clone(&cache), queue);
    Setup {
      cache,
      network,
      coordinator,
    }
  }

  fn key() -> CacheKey {
    CacheKey::from(["todos", "1"])
  }

  #[tokio::test]
  async fn test_rollback_restores_exact_snapshot() {
    let s = setup();
    s.cache.set(key(), json!("old"));
    let before = s.cache.get(&key());

    let result = s
      .coordinator
      .optimistic_update(
        key(),
        |_| json!("new"),
        || async { Err::<(), _>(eyre!("rejected by server")) },
        OptimisticOptions::default(),
      )
      .await;

    let err = result.unwrap_err();
    assert_eq!(
      err.operation_error().map(|e| e.to_string()),
      Some("rejected by server".to_string())
    );
    let after = s.cache.get(&key());
    assert_eq!(after, before);
    assert_eq!(
      serde_json::to_vec(&after).unwrap(),
      serde_json::to_vec(&before).unwrap()
    );
  }

  #[tokio::test]
  async fn test_rollback_of_absent_entry_removes_it() {
    let s = setup();

    let result = s
      .coordinator
      .optimistic_update(
        key(),
        |_| json!("new"),
        || async { Err::<(), _>(eyre!("nope")) },
        OptimisticOptions {
          enqueue: EnqueueOptions::default().max_retries(0),
          ..OptimisticOptions::default()
        },
      )
      .await;

    assert!(result.is_err());
    assert!(s.cache.get(&key()).is_none());
  }

  fn offline_update(
    coordinator: &OptimisticUpdateCoordinator,
    value: Value,
  ) -> tokio::task::JoinHandle<std::result::Result<(), QueueError>> {
    let coordinator = coordinator.clone();
    tokio::spawn(async move {
      coordinator
        .optimistic_update(
          key(),
          move |_| value,
          || async { Ok::<_, color_eyre::Report>(()) },
          OptimisticOptions::default(),
        )
        .await
    })
  }

  #[tokio::test]
  async fn test_roll_back_unsettled_restores_oldest_snapshot() {
    let s = setup();
    s.cache.set(key(), json!("old"));
    s.network.set_online(false);

    let first = offline_update(&s.coordinator, json!("first"));
    tokio::task::yield_now().await;
    let second = offline_update(&s.coordinator, json!("second"));
    tokio::task::yield_now().await;
    assert_eq!(s.cache.get(&key()).unwrap().data, Some(json!("second")));

    assert_eq!(s.coordinator.roll_back_unsettled(), 2);
    assert_eq!(s.cache.get(&key()).unwrap().data, Some(json!("old")));

    // The owning calls settle later without touching the cache again
    s.cache.set(key(), json!("after"));
    s.network.set_online(true);
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    let entry = s.cache.get(&key()).unwrap();
    assert_eq!(entry.data, Some(json!("after")));
    assert!(!entry.is_invalidated);
    assert_eq!(s.coordinator.unsettled(), 0);
  }

  #[tokio::test]
  async fn test_dropped_update_forgets_its_snapshot() {
    let s = setup();
    s.cache.set(key(), json!("old"));
    s.network.set_online(false);

    let task = offline_update(&s.coordinator, json!("new"));
    tokio::task::yield_now().await;
    assert_eq!(s.coordinator.unsettled(), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(s.coordinator.unsettled(), 0);
    assert_eq!(s.coordinator.roll_back_unsettled(), 0);
    assert_eq!(s.cache.get(&key()).unwrap().data, Some(json!("new")));
  }

  #[tokio::test]
  async fn test_speculative_value_visible_before_confirmation() {
    let s = setup();
    s.cache.set(key(), json!({"done": false}));
    s.network.set_online(false);

    let coordinator = s.coordinator.clone();
    let task = tokio::spawn(async move {
      coordinator
        .optimistic_update(
          key(),
          |old| {
            let mut todo = old.cloned().unwrap_or_else(|| json!({}));
            todo["done"] = json!(true);
            todo
          },
          || async { Ok::<_, color_eyre::Report>("saved") },
          OptimisticOptions::default(),
        )
        .await
    });

    tokio::task::yield_now().await;
    let speculative = s.cache.get(&key()).unwrap();
    assert_eq!(speculative.data, Some(json!({"done": true})));
    assert!(!speculative.is_invalidated);

    s.network.set_online(true);
    assert_eq!(task.await.unwrap().unwrap(), "saved");

    let confirmed = s.cache.get(&key()).unwrap();
    assert_eq!(confirmed.data, Some(json!({"done": true})));
    assert!(confirmed.is_invalidated);
  }

  #[tokio::test]
  async fn test_success_without_invalidation_keeps_value_fresh() {
    let s = setup();

    s.coordinator
      .optimistic_update(
        key(),
        |_| json!(1),
        || async { Ok::<_, color_eyre::Report>(()) },
        OptimisticOptions {
          invalidate_on_success: false,
          ..OptimisticOptions::default()
        },
      )
      .await
      .unwrap();

    let entry = s.cache.get(&key()).unwrap();
    assert_eq!(entry.data, Some(json!(1)));
    assert!(!entry.is_invalidated);
  }

  #[tokio::test]
  async fn test_rollback_after_retries_exhausted() {
    let s = setup();
    s.cache.set(key(), json!("old"));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let result = s
      .coordinator
      .optimistic_update(
        key(),
        |_| json!("new"),
        move || {
          let counter = Arc::clone(&counter);
          async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(eyre!("still failing"))
          }
        },
        OptimisticOptions {
          enqueue: EnqueueOptions::default().max_retries(2),
          ..OptimisticOptions::default()
        },
      )
      .await;

    assert!(matches!(result, Err(QueueError::Operation { attempts: 3, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(s.cache.get(&key()).unwrap().data, Some(json!("old")));
  }

  #[tokio::test]
  async fn test_direct_mode_runs_once() {
    let s = setup();
    s.cache.set(key(), json!("old"));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let result = s
      .coordinator
      .optimistic_update(
        key(),
        |_| json!("new"),
        move || {
          let counter = Arc::clone(&counter);
          async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(eyre!("direct failure"))
          }
        },
        OptimisticOptions {
          queued: false,
          ..OptimisticOptions::default()
        },
      )
      .await;

    assert!(matches!(result, Err(QueueError::Operation { attempts: 1, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(s.cache.get(&key()).unwrap().data, Some(json!("old")));
  }

  #[tokio::test]
  async fn test_direct_mode_timeout_rolls_back() {
    let s = setup();
    s.cache.set(key(), json!("old"));

    let result = s
      .coordinator
      .optimistic_update(
        key(),
        |_| json!("new"),
        || async {
          tokio::time::sleep(std::time::Duration::from_secs(60)).await;
          Ok::<_, color_eyre::Report>(())
        },
        OptimisticOptions {
          queued: false,
          enqueue: EnqueueOptions::default().timeout(std::time::Duration::from_millis(10)),
          ..OptimisticOptions::default()
        },
      )
      .await;

    assert!(matches!(result, Err(QueueError::TimedOut { .. })));
    assert_eq!(s.cache.get(&key()).unwrap().data, Some(json!("old")));
  }

  #[tokio::test]
  async fn test_cancelled_request_rolls_back() {
    let s = setup();
    s.cache.set(key(), json!("old"));
    s.network.set_online(false);
    let token = CancellationToken::new();

    let coordinator = s.coordinator.clone();
    let cancel = token.clone();
    let task = tokio::spawn(async move {
      coordinator
        .optimistic_update(
          key(),
          |_| json!("new"),
          || async { Ok::<_, color_eyre::Report>(()) },
          OptimisticOptions {
            enqueue: EnqueueOptions::default().cancel_with(cancel),
            ..OptimisticOptions::default()
          },
        )
        .await
    });

    tokio::task::yield_now().await;
    assert_eq!(s.cache.get(&key()).unwrap().data, Some(json!("new")));

    token.cancel();
    s.network.set_online(true);
    assert!(matches!(task.await.unwrap(), Err(QueueError::Cancelled(_))));
    assert_eq!(s.cache.get(&key()).unwrap().data, Some(json!("old")));
  }
}
