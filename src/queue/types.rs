//! Request metadata and enqueue options.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Opaque identifier assigned to a request when it is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
  pub(crate) fn new(raw: u64) -> Self {
    Self(raw)
  }

  pub(crate) fn raw(self) -> u64 {
    self.0
  }
}

impl fmt::Display for RequestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "req-{}", self.0)
  }
}

/// Drain tier. Higher tiers always drain before lower ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  #[default]
  Normal,
  Low,
}

impl Priority {
  /// Sort rank: lower drains first
  pub fn rank(self) -> u8 {
    match self {
      Priority::High => 0,
      Priority::Normal => 1,
      Priority::Low => 2,
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Priority::High => "high",
      Priority::Normal => "normal",
      Priority::Low => "low",
    };
    f.write_str(s)
  }
}

/// Serializable bookkeeping for a pending request.
///
/// This is all that survives a restart; the operation itself cannot be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
  pub id: RequestId,
  pub retry_count: u32,
  pub max_retries: u32,
  pub priority: Priority,
  /// When the request was enqueued
  pub timestamp: DateTime<Utc>,
}

/// Per-request settings for [`RequestQueue::enqueue`](super::RequestQueue::enqueue).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
  pub priority: Priority,
  /// Retry ceiling; the queue's configured default when unset
  pub max_retries: Option<u32>,
  /// Per-attempt timeout; the queue's configured default when unset
  pub timeout: Option<Duration>,
  /// Cancelling this token abandons the request
  pub cancel: Option<CancellationToken>,
}

impl EnqueueOptions {
  pub fn priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn cancel_with(mut self, token: CancellationToken) -> Self {
    self.cancel = Some(token);
    self
  }
}

/// Counters describing queue activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
  /// Drain loops started
  pub drain_passes: u64,
  /// Highest number of drain loops ever running at once
  pub max_concurrent_drains: u64,
  pub succeeded: u64,
  pub retried: u64,
  /// Requests abandoned for any reason
  pub failed: u64,
}
