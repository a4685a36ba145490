//! Broker errors.

use deferq_core::QueueError;
use thiserror::Error;

/// Errors reported by the broker primitives.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("publish rejected: {0}")]
    Publish(String),

    #[error("{0} is closed")]
    Closed(&'static str),
}

impl From<BrokerError> for QueueError {
    /// Every broker failure is a failure of the link, never of the job.
    fn from(err: BrokerError) -> Self {
        QueueError::Connection(err.to_string())
    }
}
