//! Per-job fault boundary shared by the backends.

use std::any::Any;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::error::{DispatchError, JobError};
use crate::registry::ExecutorRegistry;
use crate::types::Job;

/// How a single execution attempt ended.
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    /// The executor returned an error.
    Failed(JobError),
    /// No executor could be built for the job; nothing ran.
    Undispatchable(DispatchError),
    /// The executor panicked or its task was cancelled.
    Aborted(String),
}

impl Outcome {
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Result of [`execute_contained`].
#[derive(Debug)]
pub struct Execution {
    /// The job after execution, carrying any mutations the executor made.
    /// When the executor aborted this is the job as it was before running.
    pub job: Job,
    /// `exec_time` as it was before the executor ran.
    pub scheduled_for: DateTime<Utc>,
    pub outcome: Outcome,
}

impl Execution {
    /// Whether the job should be submitted again.
    #[inline]
    pub fn should_recur(&self) -> bool {
        self.outcome.is_success() && self.job.is_recurring
    }

    /// Whether the executor moved `exec_time` itself.
    #[inline]
    pub fn rescheduled_by_executor(&self) -> bool {
        self.job.exec_time != self.scheduled_for
    }
}

/// Resolve and run the executor for `job` inside its own task, so that a
/// panicking handler is reported as [`Outcome::Aborted`] instead of tearing
/// down the caller's loop.
pub async fn execute_contained(registry: &ExecutorRegistry, job: Job) -> Execution {
    let scheduled_for = job.exec_time;
    let mut executor = match registry.resolve(&job) {
        Ok(executor) => executor,
        Err(err) => {
            error!(job_id = %job.id, job_type = %job.job_type, error = %err, "cannot dispatch job");
            return Execution {
                job,
                scheduled_for,
                outcome: Outcome::Undispatchable(err),
            };
        }
    };

    let snapshot = job.clone();
    let task = tokio::spawn(async move {
        let mut job = job;
        let result = executor.execute(&mut job).await;
        (job, result)
    });

    match task.await {
        Ok((job, Ok(()))) => {
            debug!(job_id = %job.id, job_type = %job.job_type, "job executed");
            Execution {
                job,
                scheduled_for,
                outcome: Outcome::Succeeded,
            }
        }
        Ok((job, Err(err))) => {
            error!(job_id = %job.id, job_type = %job.job_type, error = %err, "error executing job");
            Execution {
                job,
                scheduled_for,
                outcome: Outcome::Failed(err),
            }
        }
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                "execution task cancelled".to_owned()
            };
            error!(job_id = %snapshot.id, job_type = %snapshot.job_type, %reason, "recovered from executor panic");
            Execution {
                job: snapshot,
                scheduled_for,
                outcome: Outcome::Aborted(reason),
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_owned()
    }
}
