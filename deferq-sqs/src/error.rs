//! Cloud-queue errors.

use deferq_core::QueueError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SqsError {
    #[error("region name '{0}' not found")]
    UnknownRegion(String),

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("delay of {0} seconds is outside the allowed window")]
    InvalidDelay(u32),

    /// The request never completed or was rejected by the service.
    #[error("queue request failed: {0}")]
    Request(String),
}

impl From<SqsError> for QueueError {
    fn from(err: SqsError) -> Self {
        match err {
            SqsError::UnknownRegion(name) => QueueError::UnknownRegion(name),
            SqsError::Request(msg) => QueueError::Connection(msg),
            other => QueueError::Backend(other.to_string()),
        }
    }
}
