//! Error types for the scheduler core.

use thiserror::Error;

/// Errors surfaced by `Enqueue` and `Monitor`.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no transport has been registered")]
    NoDoer,

    #[error("failed to serialize job: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The link to the queue backend failed. Callers treat this class as
    /// "my transport died" rather than "my job is bad".
    #[error("transport unavailable: {0}")]
    Connection(String),

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("unknown region: {0}")]
    UnknownRegion(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),
}

impl QueueError {
    /// Returns true for failures attributable to the transport link itself.
    #[inline]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Failure to turn a job into a runnable executor.
///
/// This is the "no executor" signal: callers must check it before running
/// anything.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no executor registered for job type '{0}'")]
    UnknownType(String),

    #[error("failed to encode payload for job type '{job_type}': {source}")]
    Encode {
        job_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to populate executor for job type '{job_type}': {source}")]
    Decode {
        job_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors reported by an [`Executor`](crate::Executor) while running a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("job failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
