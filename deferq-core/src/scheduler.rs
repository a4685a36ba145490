//! The scheduler context: executor registry plus the active transport.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::doer::Doer;
use crate::error::QueueError;
use crate::executor::Executor;
use crate::registry::ExecutorRegistry;
use crate::types::{Job, MonitorConfig};

/// Entry point for producers and consumers.
///
/// Build it once at startup, register executors and exactly one transport,
/// then share it (it is cheap to clone) with the code that enqueues jobs and
/// the task that runs [`monitor`](Self::monitor).
#[derive(Clone, Default)]
pub struct Scheduler {
    registry: Arc<ExecutorRegistry>,
    doer: Option<Arc<dyn Doer>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .field("doer", &self.doer.as_ref().map(|d| d.name()))
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under `job_type`. Must happen before monitoring starts.
    pub fn register_executor<E>(&mut self, job_type: impl Into<String>) -> &mut Self
    where
        E: Executor + Default + Serialize + DeserializeOwned,
    {
        Arc::make_mut(&mut self.registry).register::<E>(job_type);
        self
    }

    /// Register an executor built by `new` for every dispatch.
    pub fn register_executor_with<E, F>(&mut self, job_type: impl Into<String>, new: F) -> &mut Self
    where
        E: Executor + Serialize + DeserializeOwned,
        F: Fn() -> E + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry).register_with(job_type, new);
        self
    }

    /// Make `doer` the active transport. The last registration wins.
    pub fn register_doer<D: Doer + 'static>(&mut self, doer: D) -> &mut Self {
        self.register_shared_doer(Arc::new(doer))
    }

    pub fn register_shared_doer(&mut self, doer: Arc<dyn Doer>) -> &mut Self {
        if let Some(previous) = self.doer.replace(doer) {
            warn!(previous = previous.name(), "replacing registered transport");
        }
        self
    }

    #[inline]
    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// The active transport, if any.
    pub fn doer(&self) -> Option<&Arc<dyn Doer>> {
        self.doer.as_ref()
    }

    fn active(&self) -> Result<&Arc<dyn Doer>, QueueError> {
        self.doer.as_ref().ok_or(QueueError::NoDoer)
    }

    /// Submit `job` through the active transport.
    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.active()?.enqueue(job).await
    }

    /// Run the active transport's receive loop until it gives up.
    pub async fn monitor(&self, config: MonitorConfig) -> Result<(), QueueError> {
        let doer = self.active()?;
        info!(
            transport = doer.name(),
            queue = %config.queue_name,
            executors = self.registry.len(),
            "starting monitor"
        );
        doer.monitor(self.registry.clone(), config).await
    }

    /// Run [`monitor`](Self::monitor) as a background task.
    pub fn spawn_monitor(&self, config: MonitorConfig) -> JoinHandle<Result<(), QueueError>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.monitor(config).await })
    }
}
