//! Errors surfaced to callers of the offline data layer.

use std::time::Duration;

use thiserror::Error;

use crate::queue::RequestId;

/// Terminal outcome of a queued or optimistic operation.
///
/// Only terminal failures cross the layer boundary. Transient failures are
/// retried internally and persistence failures are logged and absorbed.
#[derive(Debug, Error)]
pub enum QueueError {
  /// The operation itself failed on its final allowed attempt.
  #[error("request {id} failed after {attempts} attempt(s): {error}")]
  Operation {
    id: RequestId,
    attempts: u32,
    error: color_eyre::Report,
  },

  #[error("request {id} timed out after {timeout:?}")]
  TimedOut { id: RequestId, timeout: Duration },

  #[error("request {0} was cancelled")]
  Cancelled(RequestId),

  #[error("request {0} was abandoned because the queue shut down")]
  Shutdown(RequestId),
}

impl QueueError {
  /// Id of the request this error settled.
  pub fn request_id(&self) -> RequestId {
    match self {
      QueueError::Operation { id, .. } | QueueError::TimedOut { id, .. } => *id,
      QueueError::Cancelled(id) | QueueError::Shutdown(id) => *id,
    }
  }

  /// The error the operation itself returned, if that is why it failed.
  pub fn operation_error(&self) -> Option<&color_eyre::Report> {
    match self {
      QueueError::Operation { error, .. } => Some(error),
      _ => None,
    }
  }
}
