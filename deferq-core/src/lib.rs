//! Scheduling and dispatch engine for deferred and recurring jobs.
//!
//! Jobs travel through a message queue. A producer submits a [`Job`] through
//! the active transport ([`Doer`]); a consumer runs the transport's receive
//! loop, which turns every message back into a [`Job`], builds the matching
//! [`Executor`] from the [`ExecutorRegistry`] and runs it. Recurring jobs are
//! submitted again after a successful run.
//!
//! # Architecture
//!
//! - [`Job`] - The wire record describing one unit of work
//! - [`Executor`] - Trait for implementing job handlers
//! - [`ExecutorRegistry`] - Maps job type tags to executor constructors
//! - [`Doer`] - Trait implemented by queue backends
//! - [`Scheduler`] - Holds the registry and the active backend
//! - [`dispatch::execute_contained`] - Runs one job behind a panic boundary
//!
//! # Example
//!
//! ```rust,no_run
//! use deferq_core::{async_trait, Executor, Job, JobError, MonitorConfig, Scheduler};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Ping {
//!     name: String,
//! }
//!
//! #[async_trait]
//! impl Executor for Ping {
//!     async fn execute(&mut self, job: &mut Job) -> Result<(), JobError> {
//!         println!("ping {} from job {}", self.name, job.id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run(transport: impl deferq_core::Doer + 'static) {
//! let mut scheduler = Scheduler::new();
//! scheduler.register_executor::<Ping>("Ping");
//! scheduler.register_doer(transport);
//!
//! let job = Job::new("j1", "Ping")
//!     .with_interval(1000)
//!     .recurring(true)
//!     .with_field("name", "Ada");
//! scheduler.enqueue(&job).await.unwrap();
//!
//! scheduler.spawn_monitor(MonitorConfig::new("ping-queue"));
//! # }
//! ```

pub mod dispatch;
mod doer;
mod error;
mod executor;
mod registry;
mod scheduler;
mod types;

pub use dispatch::{execute_contained, Execution, Outcome};
pub use doer::Doer;
pub use error::{DispatchError, JobError, QueueError};
pub use executor::{Executor, NoOpExecutor};
pub use registry::{populate, ExecutorFactory, ExecutorRegistry};
pub use scheduler::Scheduler;
pub use types::{Job, JobData, MonitorConfig};

// Re-export async_trait for convenience when implementing Executor and Doer
pub use async_trait::async_trait;
