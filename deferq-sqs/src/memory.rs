//! In-process queue service implementing the cloud-queue traits.
//!
//! Models per-message delays, visibility timeouts and a bounded receive wait
//! on the tokio clock, so tests can pause time. Failures can be injected per
//! queue. A per-message delay always wins over the queue's `DelaySeconds`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::SqsError;
use crate::setup::MAX_QUEUE_DELAY;
use crate::transport::{CloudQueue, QueueAttributes, QueueMessage, QueueService, VISIBILITY_TIMEOUT};

const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_VISIBILITY_SECS: u64 = 30;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One region's worth of in-memory queues.
pub struct MemoryQueueService {
    region: String,
    receive_wait: Duration,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryQueueService {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            receive_wait: DEFAULT_RECEIVE_WAIT,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// How long an empty receive waits before returning. Applies to queues
    /// created afterwards.
    #[must_use]
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// The live queue called `name`, for inspection.
    pub fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.queues)
            .get(name)
            .filter(|q| !q.is_deleted())
            .cloned()
    }
}

#[async_trait]
impl QueueService for MemoryQueueService {
    fn region(&self) -> &str {
        &self.region
    }

    async fn get_queue(&self, name: &str) -> Result<Arc<dyn CloudQueue>, SqsError> {
        match self.queue(name) {
            Some(queue) => Ok(queue),
            None => Err(SqsError::QueueNotFound(name.to_owned())),
        }
    }

    async fn create_queue(&self, name: &str, attributes: &QueueAttributes) -> Result<Arc<dyn CloudQueue>, SqsError> {
        let mut queues = lock(&self.queues);
        if let Some(existing) = queues.get(name).filter(|q| !q.is_deleted()) {
            lock(&existing.state).attributes.extend(attributes.clone());
            return Ok(existing.clone());
        }
        let queue = Arc::new(MemoryQueue::new(name, attributes.clone(), self.receive_wait));
        queues.insert(name.to_owned(), queue.clone());
        Ok(queue)
    }
}

/// A message accepted by [`CloudQueue::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub body: String,
    pub delay_seconds: u32,
}

struct Stored {
    message_id: String,
    body: String,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

#[derive(Default)]
struct QueueState {
    attributes: QueueAttributes,
    messages: Vec<Stored>,
    sent: Vec<SentMessage>,
    deleted_messages: usize,
    next_id: u64,
    fail_receives: usize,
    fail_deletes: usize,
    fail_sends: usize,
    deleted: bool,
}

impl QueueState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn visibility_timeout(&self) -> Duration {
        let secs = self
            .attributes
            .get(VISIBILITY_TIMEOUT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_VISIBILITY_SECS);
        Duration::from_secs(secs)
    }
}

pub struct MemoryQueue {
    name: String,
    receive_wait: Duration,
    state: Mutex<QueueState>,
    arrivals: Notify,
}

impl MemoryQueue {
    fn new(name: &str, attributes: QueueAttributes, receive_wait: Duration) -> Self {
        Self {
            name: name.to_owned(),
            receive_wait,
            state: Mutex::new(QueueState {
                attributes,
                ..QueueState::default()
            }),
            arrivals: Notify::new(),
        }
    }

    pub fn attributes(&self) -> QueueAttributes {
        lock(&self.state).attributes.clone()
    }

    /// Every message sent so far, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.state).sent.clone()
    }

    /// Messages stored, visible or not.
    pub fn len(&self) -> usize {
        lock(&self.state).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deleted_messages(&self) -> usize {
        lock(&self.state).deleted_messages
    }

    pub fn is_deleted(&self) -> bool {
        lock(&self.state).deleted
    }

    pub fn fail_next_receives(&self, count: usize) {
        lock(&self.state).fail_receives = count;
    }

    pub fn fail_next_deletes(&self, count: usize) {
        lock(&self.state).fail_deletes = count;
    }

    pub fn fail_next_sends(&self, count: usize) {
        lock(&self.state).fail_sends = count;
    }
}

#[async_trait]
impl CloudQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive_messages(&self, max: usize) -> Result<Vec<QueueMessage>, SqsError> {
        let deadline = Instant::now() + self.receive_wait;
        loop {
            let wake_at = {
                let mut state = lock(&self.state);
                if state.deleted {
                    return Err(SqsError::QueueNotFound(self.name.clone()));
                }
                if state.fail_receives > 0 {
                    state.fail_receives -= 1;
                    return Err(SqsError::Request("receive failed".to_owned()));
                }

                let now = Instant::now();
                let hidden_until = now + state.visibility_timeout();
                let QueueState {
                    messages, next_id, ..
                } = &mut *state;
                let mut received = Vec::new();
                for message in messages.iter_mut().filter(|m| m.visible_at <= now).take(max) {
                    *next_id += 1;
                    let receipt_handle = format!("receipt-{next_id}");
                    message.visible_at = hidden_until;
                    message.receipt_handle = Some(receipt_handle.clone());
                    received.push(QueueMessage {
                        message_id: message.message_id.clone(),
                        receipt_handle,
                        body: message.body.clone(),
                    });
                }
                if !received.is_empty() || now >= deadline || max == 0 {
                    return Ok(received);
                }

                state
                    .messages
                    .iter()
                    .map(|m| m.visible_at)
                    .min()
                    .map_or(deadline, |next| next.min(deadline))
            };

            tokio::select! {
                _ = self.arrivals.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete_message(&self, message: &QueueMessage) -> Result<(), SqsError> {
        let mut state = lock(&self.state);
        if state.fail_deletes > 0 {
            state.fail_deletes -= 1;
            return Err(SqsError::Request("delete failed".to_owned()));
        }
        let position = state
            .messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(message.receipt_handle.as_str()));
        match position {
            Some(index) => {
                state.messages.remove(index);
                state.deleted_messages += 1;
                Ok(())
            }
            None => Err(SqsError::Request(format!(
                "receipt handle '{}' is not valid",
                message.receipt_handle
            ))),
        }
    }

    async fn send_message(&self, body: &str, delay_seconds: u32) -> Result<String, SqsError> {
        let message_id = {
            let mut state = lock(&self.state);
            if state.deleted {
                return Err(SqsError::QueueNotFound(self.name.clone()));
            }
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                return Err(SqsError::Request("send failed".to_owned()));
            }
            if delay_seconds > MAX_QUEUE_DELAY {
                return Err(SqsError::InvalidDelay(delay_seconds));
            }
            let message_id = format!("msg-{}", state.next_id());
            state.messages.push(Stored {
                message_id: message_id.clone(),
                body: body.to_owned(),
                visible_at: Instant::now() + Duration::from_secs(u64::from(delay_seconds)),
                receipt_handle: None,
            });
            state.sent.push(SentMessage {
                message_id: message_id.clone(),
                body: body.to_owned(),
                delay_seconds,
            });
            message_id
        };
        self.arrivals.notify_one();
        Ok(message_id)
    }

    async fn delete(&self) -> Result<(), SqsError> {
        let mut state = lock(&self.state);
        state.deleted = true;
        state.messages.clear();
        Ok(())
    }
}
