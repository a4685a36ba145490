//! Polled cloud-queue backend for the deferq scheduler.
//!
//! The queue can only hold a message back for up to fifteen minutes, so the
//! consumer gates execution on the job's own `exec_time`: a job that arrives
//! early is sent back for the time it still has to wait (or dropped, see
//! [`GateMiss`]). Regions are addressed by friendly name through
//! [`SqsRegions`]; [`memory::MemoryQueueService`] implements the queue
//! primitives in process.

mod config;
mod doer;
mod error;
pub mod memory;
mod regions;
mod setup;
mod transport;

pub use config::{default_buffer_capacity, GateMiss, SqsSettings};
pub use doer::{delay_seconds, SqsDoer};
pub use error::SqsError;
pub use regions::{region_id, SqsRegions, REGION_NAMES};
pub use setup::{
    create_queue, create_queue_with_delay, delete_queue, send_message, setup, SqsConfig,
    MAX_QUEUE_DELAY, MIN_QUEUE_DELAY,
};
pub use transport::{
    CloudQueue, QueueAttributes, QueueMessage, QueueService, DELAY_SECONDS, RECEIVE_WAIT_TIME,
    RETENTION_PERIOD, VISIBILITY_TIMEOUT,
};
