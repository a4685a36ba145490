//! Push backend for the deferq scheduler.
//!
//! Jobs are published to a durable delayed-message exchange with the job's
//! interval in the `x-delay` header; the broker holds each message back for
//! that long and then routes it by topic to the bound queues. The monitor
//! consumes a queue with manual acknowledgements and re-publishes recurring
//! jobs after a successful run.
//!
//! The broker itself sits behind the [`Connector`], [`Connection`] and
//! [`Channel`] traits. [`memory::MemoryBroker`] implements them in process.

mod config;
mod doer;
mod error;
mod link;
pub mod memory;
mod setup;
mod transport;

pub use config::{RmqConfig, RmqSettings, DEFAULT_EXCHANGE};
pub use doer::RmqDoer;
pub use error::BrokerError;
pub use setup::setup;
pub use transport::{
    Acknowledger, Channel, Connection, Connector, ConsumeOptions, Deliveries, Delivery,
    DeliveryMode, ExchangeOptions, Headers, Publishing, QueueOptions, DELAYED_EXCHANGE_KIND,
    DELAYED_TYPE_ARGUMENT, DELAY_HEADER,
};
