//! Job executor trait for implementing job handlers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::types::Job;

/// Trait for implementing job executors.
///
/// An executor is a typed value whose fields are populated from the job's
/// payload just before it runs. Each dispatch gets a fresh instance, so an
/// executor never sees state left behind by another job.
///
/// `execute` may mutate the job (for example clear `is_recurring` or move
/// `exec_time`) to control whether and when it runs again. Returning an error
/// suppresses re-enqueueing of recurring jobs.
#[async_trait]
pub trait Executor: Send + 'static {
    async fn execute(&mut self, job: &mut Job) -> Result<(), JobError>;
}

/// An executor that completes immediately.
///
/// Useful as a placeholder registration while the real handler is not ready.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NoOpExecutor {}

#[async_trait]
impl Executor for NoOpExecutor {
    async fn execute(&mut self, _job: &mut Job) -> Result<(), JobError> {
        Ok(())
    }
}
