//! Cloud-queue primitives the poll backend is written against.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SqsError;

/// Queue attributes by their service names.
pub type QueueAttributes = BTreeMap<String, String>;

pub const VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";
pub const RECEIVE_WAIT_TIME: &str = "ReceiveMessageWaitTimeSeconds";
pub const RETENTION_PERIOD: &str = "MessageRetentionPeriod";
pub const DELAY_SECONDS: &str = "DelaySeconds";

/// A received message. The receipt handle is what deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// One regional endpoint of the queue service.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Native region identifier, e.g. `us-east-1`.
    fn region(&self) -> &str;

    async fn get_queue(&self, name: &str) -> Result<Arc<dyn CloudQueue>, SqsError>;

    /// Create `name` or return the existing queue. Attributes of an existing
    /// queue are updated.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<Arc<dyn CloudQueue>, SqsError>;
}

#[async_trait]
pub trait CloudQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Short-poll for up to `max` messages. Returns an empty batch when the
    /// wait window elapses without a visible message.
    async fn receive_messages(&self, max: usize) -> Result<Vec<QueueMessage>, SqsError>;

    async fn delete_message(&self, message: &QueueMessage) -> Result<(), SqsError>;

    /// Send `body`, invisible for `delay_seconds`. Returns the message id.
    async fn send_message(&self, body: &str, delay_seconds: u32) -> Result<String, SqsError>;

    /// Delete the queue and everything in it.
    async fn delete(&self) -> Result<(), SqsError>;
}
