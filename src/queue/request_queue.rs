//! Priority request queue with bounded retry and network gating.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{EnqueueOptions, QueueStats, RequestId, RequestRecord};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::event::{EventBus, LayerEvent};
use crate::network::{NetworkMonitor, ResumeHook};
use crate::storage::Storage;

/// One attempt of a type-erased operation. The typed result is delivered to the
/// caller from inside the future; the queue only sees success or failure.
type AttemptFn = Box<dyn FnMut() -> BoxFuture<'static, Result<()>> + Send>;

type RejectFn = Box<dyn FnOnce(QueueError) + Send>;

struct QueuedRequest {
  record: RequestRecord,
  /// FIFO tie-break within a tier; reassigned on retry so a failed item
  /// goes behind the untouched ones
  seq: u64,
  /// Not eligible again before this instant (retry delay)
  not_before: Option<Instant>,
  timeout: Option<Duration>,
  cancel: CancellationToken,
  attempt: AttemptFn,
  reject: RejectFn,
}

impl QueuedRequest {
  fn order_key(&self) -> (u8, u64) {
    (self.record.priority.rank(), self.seq)
  }

  fn is_eligible(&self, now: Instant) -> bool {
    self.not_before.map_or(true, |t| t <= now)
  }
}

struct InFlight {
  record: RequestRecord,
  cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
  /// Sorted by `(priority rank, seq)`
  items: Vec<QueuedRequest>,
  in_flight: Option<InFlight>,
  draining: bool,
  shut_down: bool,
  next_seq: u64,
}

impl QueueState {
  fn insert(&mut self, request: QueuedRequest) {
    let key = request.order_key();
    let pos = self.items.partition_point(|r| r.order_key() < key);
    self.items.insert(pos, request);
  }

  fn records(&self) -> Vec<RequestRecord> {
    self
      .in_flight
      .iter()
      .map(|f| f.record.clone())
      .chain(self.items.iter().map(|r| r.record.clone()))
      .collect()
  }
}

enum Next {
  Ready(QueuedRequest),
  /// Items exist but none is eligible before this instant
  Wait(Instant),
  /// Drain loop must stop; the draining flag has already been released
  Stop,
}

enum Outcome {
  Success,
  Failed(color_eyre::Report),
  TimedOut(Duration),
  Cancelled,
}

#[derive(Default)]
struct Counters {
  drain_passes: AtomicU64,
  active_drains: AtomicU64,
  max_concurrent_drains: AtomicU64,
  succeeded: AtomicU64,
  retried: AtomicU64,
  failed: AtomicU64,
}

/// Holds pending write operations and runs them one at a time.
///
/// Requests drain in `(priority, enqueue order)` order, re-evaluated before every
/// dequeue. A failed attempt is put back until its retry ceiling is reached;
/// the next failure after that rejects the caller. Nothing is attempted while
/// the [`NetworkMonitor`] reports offline.
pub struct RequestQueue {
  this: Weak<RequestQueue>,
  state: Mutex<QueueState>,
  /// Serializes snapshot + write so the last write is always the latest state
  persist_lock: Mutex<()>,
  wake: Notify,
  next_id: AtomicU64,
  network: Arc<NetworkMonitor>,
  storage: Arc<dyn Storage>,
  events: EventBus,
  config: QueueConfig,
  recovered: Vec<RequestRecord>,
  counters: Counters,
}

impl RequestQueue {
  /// Create a queue and register it for resume signals with `network`.
  ///
  /// Metadata left behind by a previous process is loaded for diagnostics.
  /// Those requests cannot be resumed since their operations were not stored.
  pub fn new(
    config: QueueConfig,
    network: Arc<NetworkMonitor>,
    storage: Arc<dyn Storage>,
    events: EventBus,
  ) -> Arc<Self> {
    let recovered = match storage.load_queue() {
      Ok(records) => records,
      Err(e) => {
        warn!("queue: failed to load persisted request metadata: {}", e);
        Vec::new()
      }
    };
    if !recovered.is_empty() {
      warn!(
        count = recovered.len(),
        "queue: found requests left pending by a previous run; they cannot be resumed"
      );
    }
    let first_id = recovered
      .iter()
      .map(|r| r.id.raw() + 1)
      .max()
      .unwrap_or(1);

    let queue = Arc::new_cyclic(|this: &Weak<RequestQueue>| Self {
      this: this.clone(),
      state: Mutex::new(QueueState::default()),
      persist_lock: Mutex::new(()),
      wake: Notify::new(),
      next_id: AtomicU64::new(first_id),
      network: Arc::clone(&network),
      storage,
      events,
      config,
      recovered,
      counters: Counters::default(),
    });

    let hook: Weak<dyn ResumeHook> = Arc::downgrade(&queue) as Weak<dyn ResumeHook>;
    network.register_resume_hook(hook);
    queue
  }

  /// Allocate a request id without enqueueing anything.
  pub(crate) fn next_id(&self) -> RequestId {
    RequestId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
  }

  pub(crate) fn default_timeout(&self) -> Option<Duration> {
    self.config.operation_timeout()
  }

  /// Add an operation to the queue and start draining if possible.
  ///
  /// `operation` is invoked again verbatim on every retry, so it must be safe to
  /// repeat. The returned future settles once the request succeeds or is
  /// abandoned; dropping it does not cancel the request.
  pub fn enqueue<T, F, Fut>(&self, mut operation: F, options: EnqueueOptions) -> PendingRequest<T>
  where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let id = self.next_id();
    let (tx, rx) = oneshot::channel();
    let pending = PendingRequest { id, rx };

    let record = RequestRecord {
      id,
      retry_count: 0,
      max_retries: options
        .max_retries
        .unwrap_or(self.config.default_max_retries),
      priority: options.priority,
      timestamp: Utc::now(),
    };

    let slot = Arc::new(Mutex::new(Some(tx)));
    let success_slot = Arc::clone(&slot);
    let attempt: AttemptFn = Box::new(move || {
      let fut = operation();
      let slot = Arc::clone(&success_slot);
      async move {
        let value = fut.await?;
        if let Some(tx) = slot.lock().take() {
          // Receiver may have been dropped
          let _ = tx.send(Ok(value));
        }
        Ok(())
      }
      .boxed()
    });
    let reject: RejectFn = Box::new(move |error| {
      if let Some(tx) = slot.lock().take() {
        let _ = tx.send(Err(error));
      }
    });

    let cancel = options
      .cancel
      .map(|t| t.child_token())
      .unwrap_or_default();

    {
      let mut state = self.state.lock();
      if state.shut_down {
        drop(state);
        reject(QueueError::Shutdown(id));
        return pending;
      }
      let seq = state.next_seq;
      state.next_seq += 1;
      state.insert(QueuedRequest {
        record: record.clone(),
        seq,
        not_before: None,
        timeout: options.timeout.or(self.config.operation_timeout()),
        cancel,
        attempt,
        reject,
      });
    }

    debug!(%id, priority = %record.priority, max_retries = record.max_retries, "queue: enqueued request");
    self.events.publish(LayerEvent::RequestQueued {
      id,
      priority: record.priority,
    });
    self.persist();
    self.wake.notify_one();
    self.process_queue();

    pending
  }

  /// Start a drain loop unless one is running, the queue is empty, or the
  /// network is offline. Returns whether a loop was started.
  pub fn process_queue(&self) -> bool {
    {
      let mut state = self.state.lock();
      if state.draining
        || state.shut_down
        || state.items.is_empty()
        || !self.network.is_online()
      {
        return false;
      }
      state.draining = true;
    }

    let runtime = tokio::runtime::Handle::try_current();
    match (self.this.upgrade(), runtime) {
      (Some(queue), Ok(runtime)) => {
        runtime.spawn(async move { queue.drain().await });
        true
      }
      (_, Err(e)) => {
        warn!("queue: cannot drain outside a tokio runtime: {}", e);
        self.state.lock().draining = false;
        false
      }
      (None, _) => {
        self.state.lock().draining = false;
        false
      }
    }
  }

  async fn drain(self: Arc<Self>) {
    let active = self.counters.active_drains.fetch_add(1, Ordering::SeqCst) + 1;
    self
      .counters
      .max_concurrent_drains
      .fetch_max(active, Ordering::SeqCst);
    self.counters.drain_passes.fetch_add(1, Ordering::SeqCst);

    let total = self.len();
    info!(total, "queue: processing");
    self.events.publish(LayerEvent::QueueProcessing { total });

    loop {
      match self.take_next() {
        Next::Ready(request) => self.run(request).await,
        Next::Wait(deadline) => {
          tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = self.wake.notified() => {}
          }
        }
        Next::Stop => break,
      }
    }

    self.counters.active_drains.fetch_sub(1, Ordering::SeqCst);
    info!(remaining = self.len(), "queue: processed");
    self.events.publish(LayerEvent::QueueProcessed);
  }

  /// Pick the next eligible request. When the loop has to stop, the draining
  /// flag is released in the same critical section as the check, so a
  /// concurrent `process_queue` either sees the flag set before the check or
  /// finds it released afterwards.
  fn take_next(&self) -> Next {
    let mut state = self.state.lock();

    if state.shut_down || state.items.is_empty() {
      state.draining = false;
      return Next::Stop;
    }
    if !self.network.is_online() {
      debug!("queue: offline, pausing drain");
      state.draining = false;
      return Next::Stop;
    }

    let now = Instant::now();
    match state.items.iter().position(|r| r.is_eligible(now)) {
      Some(pos) => {
        let request = state.items.remove(pos);
        state.in_flight = Some(InFlight {
          record: request.record.clone(),
          cancel: request.cancel.clone(),
        });
        Next::Ready(request)
      }
      None => {
        let deadline = state
          .items
          .iter()
          .filter_map(|r| r.not_before)
          .min()
          .unwrap_or(now);
        Next::Wait(deadline)
      }
    }
  }

  async fn run(&self, mut request: QueuedRequest) {
    let id = request.record.id;
    let outcome = if request.cancel.is_cancelled() {
      Outcome::Cancelled
    } else {
      debug!(%id, attempt = request.record.retry_count + 1, "queue: attempting request");
      let fut = (request.attempt)();
      let timeout = request.timeout;
      let cancel = request.cancel.clone();
      tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        result = run_with_timeout(fut, timeout) => match result {
          Some(Ok(())) => Outcome::Success,
          Some(Err(e)) => Outcome::Failed(e),
          None => Outcome::TimedOut(timeout.unwrap_or_default()),
        },
      }
    };

    let shut_down = {
      let mut state = self.state.lock();
      state.in_flight = None;
      state.shut_down
    };

    match outcome {
      Outcome::Success => {
        debug!(%id, "queue: request succeeded");
        self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
        self.events.publish(LayerEvent::RequestSuccess { id });
      }
      Outcome::Failed(error) if request.record.retry_count < request.record.max_retries && !shut_down => {
        request.record.retry_count += 1;
        let retry_count = request.record.retry_count;
        request.not_before = self.retry_delay(retry_count).map(|d| Instant::now() + d);
        debug!(%id, retry_count, "queue: request failed, will retry: {}", error);
        self.counters.retried.fetch_add(1, Ordering::SeqCst);
        self.events.publish(LayerEvent::RequestRetry { id, retry_count });
        let mut state = self.state.lock();
        request.seq = state.next_seq;
        state.next_seq += 1;
        state.insert(request);
      }
      Outcome::Failed(error) => {
        let attempts = request.record.retry_count + 1;
        self.abandon(request, QueueError::Operation { id, attempts, error });
      }
      Outcome::TimedOut(timeout) => {
        self.abandon(request, QueueError::TimedOut { id, timeout });
      }
      Outcome::Cancelled if shut_down => {
        self.abandon(request, QueueError::Shutdown(id));
      }
      Outcome::Cancelled => {
        self.abandon(request, QueueError::Cancelled(id));
      }
    }

    self.persist();
  }

  fn retry_delay(&self, retry_count: u32) -> Option<Duration> {
    let base = self.config.retry_delay();
    if base.is_zero() {
      return None;
    }
    let factor = 1u32 << retry_count.saturating_sub(1).min(16);
    Some(base.saturating_mul(factor))
  }

  fn abandon(&self, request: QueuedRequest, error: QueueError) {
    let id = request.record.id;
    let message = error.to_string();
    warn!(%id, "queue: request abandoned: {}", message);
    self.counters.failed.fetch_add(1, Ordering::SeqCst);
    self.events.publish(LayerEvent::RequestFailed { id, error: message });
    (request.reject)(error);
  }

  /// Abandon a request. A waiting request is rejected immediately; an in-flight
  /// attempt is dropped at its next suspension point. Returns false when no
  /// pending request has this id.
  pub fn cancel(&self, id: RequestId) -> bool {
    let removed = {
      let mut state = self.state.lock();
      if let Some(flight) = state.in_flight.as_ref().filter(|f| f.record.id == id) {
        flight.cancel.cancel();
        return true;
      }
      state
        .items
        .iter()
        .position(|r| r.record.id == id)
        .map(|pos| state.items.remove(pos))
    };

    match removed {
      Some(request) => {
        self.abandon(request, QueueError::Cancelled(id));
        self.persist();
        true
      }
      None => false,
    }
  }

  /// Reject everything pending and refuse new work.
  pub fn shutdown(&self) {
    let pending = {
      let mut state = self.state.lock();
      state.shut_down = true;
      if let Some(flight) = &state.in_flight {
        flight.cancel.cancel();
      }
      std::mem::take(&mut state.items)
    };

    if !pending.is_empty() {
      info!(count = pending.len(), "queue: shutting down with pending requests");
    }
    for request in pending {
      let id = request.record.id;
      self.abandon(request, QueueError::Shutdown(id));
    }
    self.wake.notify_one();
    self.persist();
  }

  fn persist(&self) {
    let _guard = self.persist_lock.lock();
    let records = self.state.lock().records();
    if let Err(e) = self.storage.save_queue(&records) {
      warn!("queue: failed to persist request metadata: {}", e);
    }
  }

  /// Pending requests, including one in flight.
  pub fn len(&self) -> usize {
    let state = self.state.lock();
    state.items.len() + usize::from(state.in_flight.is_some())
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_processing(&self) -> bool {
    self.state.lock().draining
  }

  /// Metadata of pending requests: the in-flight one first, then drain order.
  pub fn snapshot(&self) -> Vec<RequestRecord> {
    self.state.lock().records()
  }

  /// Requests a previous process left pending.
  pub fn recovered(&self) -> &[RequestRecord] {
    &self.recovered
  }

  pub fn stats(&self) -> QueueStats {
    let c = &self.counters;
    QueueStats {
      drain_passes: c.drain_passes.load(Ordering::SeqCst),
      max_concurrent_drains: c.max_concurrent_drains.load(Ordering::SeqCst),
      succeeded: c.succeeded.load(Ordering::SeqCst),
      retried: c.retried.load(Ordering::SeqCst),
      failed: c.failed.load(Ordering::SeqCst),
    }
  }
}

impl ResumeHook for RequestQueue {
  fn on_online(&self) {
    if self.process_queue() {
      debug!("queue: resumed after reconnect");
    }
  }
}

impl std::fmt::Debug for RequestQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RequestQueue")
      .field("pending", &self.len())
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}

/// Run `fut`, giving up after `timeout`. `None` means it timed out.
pub(crate) async fn run_with_timeout<T>(
  fut: impl Future<Output = T>,
  timeout: Option<Duration>,
) -> Option<T> {
  match timeout {
    Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
    None => Some(fut.await),
  }
}

/// Settles with the request's final outcome.
#[derive(Debug)]
pub struct PendingRequest<T> {
  id: RequestId,
  rx: oneshot::Receiver<std::result::Result<T, QueueError>>,
}

impl<T> PendingRequest<T> {
  pub fn id(&self) -> RequestId {
    self.id
  }
}

impl<T> Future for PendingRequest<T> {
  type Output = std::result::Result<T, QueueError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let id = self.id;
    match Pin::new(&mut self.rx).poll(cx) {
      Poll::Ready(Ok(result)) => Poll::Ready(result),
      // Sender dropped unsettled: the queue itself went away
      Poll::Ready(Err(_)) => Poll::Ready(Err(QueueError::Shutdown(id))),
      Poll::Pending => Poll::Pending,
    }
  }
}
