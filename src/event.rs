use tokio::sync::broadcast;
use tracing::trace;

use crate::cache::CacheKey;
use crate::queue::{Priority, RequestId};

/// Events published by the offline data layer
#[derive(Debug, Clone, PartialEq)]
pub enum LayerEvent {
  /// A request was added to the queue
  RequestQueued { id: RequestId, priority: Priority },
  /// A request's operation succeeded
  RequestSuccess { id: RequestId },
  /// A request failed and was put back for another attempt
  RequestRetry { id: RequestId, retry_count: u32 },
  /// A request was abandoned; `error` is the rendered terminal error
  RequestFailed { id: RequestId, error: String },
  /// A drain pass started with `total` pending requests
  QueueProcessing { total: usize },
  /// A drain pass finished or paused
  QueueProcessed,
  NetworkOnline,
  NetworkOffline,
  /// Entries removed by a pressure-triggered prune
  CachePruned { removed: Vec<CacheKey> },
}

/// Fire-and-forget publish/subscribe registry for [`LayerEvent`]s.
///
/// Publishing never fails: with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<LayerEvent>,
}

impl EventBus {
  /// Create a bus that buffers up to `capacity` events per lagging subscriber
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn publish(&self, event: LayerEvent) {
    if self.tx.send(event).is_err() {
      trace!("no subscribers for layer event");
    }
  }

  /// Subscribe to every event published from now on
  pub fn subscribe(&self) -> broadcast::Receiver<LayerEvent> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}
