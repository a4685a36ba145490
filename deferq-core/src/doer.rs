//! Backend-neutral transport contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::registry::ExecutorRegistry;
use crate::types::{Job, MonitorConfig};

/// A queue backend able to submit jobs and run a receive loop.
#[async_trait]
pub trait Doer: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Serialize `job` and submit it to its destination queue.
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Run the receive loop for `config.queue_name`, dispatching jobs through
    /// `registry`. Does not return under normal operation; an `Err` means the
    /// backend reached a state it cannot recover from by itself.
    async fn monitor(
        &self,
        registry: Arc<ExecutorRegistry>,
        config: MonitorConfig,
    ) -> Result<(), QueueError>;
}
