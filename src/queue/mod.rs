//! Offline-resilient mutation queue.
//!
//! Write operations are held in priority order and executed one at a time while
//! the network is available. Failed attempts are retried up to a per-request
//! ceiling; only the final outcome reaches the caller. Request metadata (never
//! the operation itself) is written to storage after every change.

mod request_queue;
mod types;

pub use request_queue::{PendingRequest, RequestQueue};
pub(crate) use request_queue::run_with_timeout;
pub use types::{EnqueueOptions, Priority, QueueStats, RequestId, RequestRecord};
