//! Capability traits over the broker client.
//!
//! The scheduler only needs a handful of primitives from an AMQP client: dial
//! a connection, open channels, declare topology, publish, consume and ack.
//! Adapters for a concrete client implement these traits; [`crate::memory`]
//! provides an in-process implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// Message headers (an AMQP field table).
pub type Headers = BTreeMap<String, Value>;

/// Header carrying the per-message delay in milliseconds.
pub const DELAY_HEADER: &str = "x-delay";

/// Exchange type of a delayed-message exchange.
pub const DELAYED_EXCHANGE_KIND: &str = "x-delayed-message";

/// Argument naming the routing type a delayed exchange applies after the delay.
pub const DELAYED_TYPE_ARGUMENT: &str = "x-delayed-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub delivery_mode: DeliveryMode,
    pub content_type: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Publishing {
    /// The delay requested through the [`DELAY_HEADER`], in milliseconds.
    pub fn delay_ms(&self) -> u64 {
        self.headers
            .get(DELAY_HEADER)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
}

impl ConsumeOptions {
    /// Manual acknowledgement, shared queue.
    pub const fn manual_ack() -> Self {
        Self {
            auto_ack: false,
            exclusive: false,
        }
    }
}

/// Settles deliveries on the channel they arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    /// Set when the broker hands out a message a closed channel never acked.
    pub redelivered: bool,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub acker: Arc<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("consumer_tag", &self.consumer_tag)
            .field("redelivered", &self.redelivered)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl Delivery {
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack(self.delivery_tag).await
    }
}

/// Stream of deliveries for one consumer. Ends when the channel or
/// connection behind it goes away.
pub type Deliveries = mpsc::UnboundedReceiver<Delivery>;

/// Dials new connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;
    async fn close(&self);
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn exchange_declare(&self, name: &str, options: &ExchangeOptions) -> Result<(), BrokerError>;

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Publishing,
    ) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<Deliveries, BrokerError>;

    async fn close(&self);
}

/// Whether two handles point at the same underlying object.
#[inline]
pub(crate) fn same_handle<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
