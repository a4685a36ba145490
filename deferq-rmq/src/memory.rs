//! In-process broker implementing the transport traits.
//!
//! Supports delayed-message, topic, direct and fanout exchanges, manual
//! acknowledgements and injected failures. Deliveries not yet acked when
//! their channel or connection closes go back to the head of their queue. Used by the tests and the demo
//! worker; it keeps everything in memory and loses it on drop.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BrokerError;
use crate::transport::{
    Acknowledger, Channel, Connection, Connector, ConsumeOptions, Deliveries, Delivery,
    ExchangeOptions, Headers, Publishing, QueueOptions, DELAYED_EXCHANGE_KIND,
    DELAYED_TYPE_ARGUMENT,
};

/// A message accepted by [`Channel::publish`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: Publishing,
}

struct Message {
    routing_key: String,
    headers: Headers,
    body: Vec<u8>,
    redelivered: bool,
}

/// A delivery handed to a consumer and not yet acked.
struct Unacked {
    queue: String,
    connection_id: u64,
    channel_id: u64,
    message: Message,
}

struct ConsumerSlot {
    connection_id: u64,
    channel_id: u64,
    tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeOptions>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    acked: Vec<u64>,
    unacked: BTreeMap<u64, Unacked>,
    next_delivery_tag: u64,
    next_id: u64,
    dials: usize,
    fail_dials: usize,
    fail_channels: usize,
    fail_publishes: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn queues_for(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let Some(options) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        let kind = if options.kind == DELAYED_EXCHANGE_KIND {
            options
                .arguments
                .get(DELAYED_TYPE_ARGUMENT)
                .map(String::as_str)
                .unwrap_or("direct")
        } else {
            options.kind.as_str()
        };
        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                "fanout" => true,
                "direct" => b.pattern == routing_key,
                _ => topic_matches(&b.pattern, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();
        queues.dedup();
        queues
    }

    fn deliver(&mut self, broker: &MemoryBroker, queue: &str, message: Message) {
        let Some(state) = self.queues.get_mut(queue) else {
            debug!(%queue, "dropping message for missing queue");
            return;
        };
        state.ready.push_back(message);
        self.dispatch(broker, queue);
    }

    /// Hand ready messages to live consumers, round robin.
    fn dispatch(&mut self, broker: &MemoryBroker, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        state.consumers.retain(|c| !c.tx.is_closed());
        while !state.consumers.is_empty() {
            let Some(message) = state.ready.pop_front() else {
                break;
            };
            let index = state.next_consumer % state.consumers.len();
            state.next_consumer = state.next_consumer.wrapping_add(1);
            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let slot = &state.consumers[index];
            let delivery = Delivery {
                delivery_tag: tag,
                consumer_tag: slot.tag.clone(),
                redelivered: message.redelivered,
                routing_key: message.routing_key.clone(),
                headers: message.headers.clone(),
                body: message.body.clone(),
                acker: Arc::new(MemoryAcker {
                    broker: broker.clone(),
                }),
            };
            let (connection_id, channel_id) = (slot.connection_id, slot.channel_id);
            if slot.tx.send(delivery).is_ok() {
                self.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_owned(),
                        connection_id,
                        channel_id,
                        message,
                    },
                );
            } else {
                state.consumers.remove(index);
                state.ready.push_front(message);
            }
        }
    }

    /// Cancel consumers; `predicate` receives `(connection_id, channel_id)`.
    fn drop_consumers_where(&mut self, predicate: impl Fn(u64, u64) -> bool) {
        for state in self.queues.values_mut() {
            state
                .consumers
                .retain(|c| !predicate(c.connection_id, c.channel_id));
        }
    }

    /// Return unacked deliveries of closed channels to the head of their
    /// queues, oldest first, and hand them to whoever is still consuming.
    fn requeue_unacked_where(&mut self, broker: &MemoryBroker, predicate: impl Fn(u64, u64) -> bool) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| predicate(u.connection_id, u.channel_id))
            .map(|(tag, _)| *tag)
            .collect();

        let mut touched: Vec<String> = Vec::new();
        for tag in tags.into_iter().rev() {
            let Some(Unacked { queue, mut message, .. }) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(state) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                state.ready.push_front(message);
                debug!(%queue, tag, "requeued unacked delivery");
            }
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }
        for queue in touched {
            self.dispatch(broker, &queue);
        }
    }

    /// Tear down everything belonging to the matching channels.
    fn close_where(&mut self, broker: &MemoryBroker, predicate: impl Fn(u64, u64) -> bool + Copy) {
        self.drop_consumers_where(predicate);
        self.requeue_unacked_where(broker, predicate);
    }
}

/// Match a routing key against a topic binding pattern (`*` is exactly one
/// word, `#` is zero or more words).
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connector dialing this broker.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn dial_count(&self) -> usize {
        self.lock().dials
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
    }

    pub fn fail_next_dials(&self, count: usize) {
        self.lock().fail_dials = count;
    }

    pub fn fail_next_channels(&self, count: usize) {
        self.lock().fail_channels = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().fail_publishes = count;
    }

    /// Cancel every consumer, ending their delivery streams. Deliveries
    /// already handed out stay unacked until acked or their channel closes.
    pub fn drop_consumers(&self) {
        self.lock().drop_consumers_where(|_, _| true);
    }

    /// Deliveries handed out and not yet acked.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    fn route(&self, exchange: &str, routing_key: &str, message: &Publishing, delayed: bool) {
        let queues = self.lock().queues_for(exchange, routing_key);
        for queue in queues {
            let pending = Message {
                routing_key: routing_key.to_owned(),
                headers: message.headers.clone(),
                body: message.body.clone(),
                redelivered: false,
            };
            let delay = if delayed { message.delay_ms() } else { 0 };
            if delay == 0 {
                self.lock().deliver(self, &queue, pending);
            } else {
                let broker = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    broker.lock().deliver(&broker, &queue, pending);
                });
            }
        }
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn dial(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let mut state = self.broker.lock();
        if state.fail_dials > 0 {
            state.fail_dials -= 1;
            return Err(BrokerError::Connection("dial refused".to_owned()));
        }
        state.dials += 1;
        let id = state.next_id();
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed("connection"));
        }
        let mut state = self.broker.lock();
        if state.fail_channels > 0 {
            state.fail_channels -= 1;
            return Err(BrokerError::Channel("channel open refused".to_owned()));
        }
        let id = state.next_id();
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection_id: self.id,
            connection_closed: self.closed.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let id = self.id;
        self.broker
            .lock()
            .close_where(&self.broker, |connection_id, _| connection_id == id);
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection_id: u64,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.connection_closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed("connection"))
        } else if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed("channel"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn exchange_declare(&self, name: &str, options: &ExchangeOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .lock()
            .exchanges
            .insert(name.to_owned(), options.clone());
        Ok(())
    }

    async fn queue_declare(&self, name: &str, _options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .lock()
            .queues
            .entry(name.to_owned())
            .or_default();
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("no queue '{queue}'")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                pattern: routing_key.to_owned(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Publishing) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let delayed = {
            let mut state = self.broker.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(BrokerError::Publish("injected failure".to_owned()));
            }
            let Some(options) = state.exchanges.get(exchange) else {
                return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
            };
            let delayed = options.kind == DELAYED_EXCHANGE_KIND;
            state.published.push(PublishedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message: message.clone(),
            });
            delayed
        };
        self.broker.route(exchange, routing_key, message, delayed);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, _options: ConsumeOptions) -> Result<Deliveries, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.lock();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Channel(format!("no queue '{queue}'")));
        };
        queue_state.consumers.push(ConsumerSlot {
            connection_id: self.connection_id,
            channel_id: self.id,
            tag: consumer_tag.to_owned(),
            tx,
        });
        state.dispatch(&self.broker, queue);
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let id = self.id;
        self.broker
            .lock()
            .close_where(&self.broker, |_, channel_id| channel_id == id);
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(BrokerError::Channel(format!("unknown delivery tag {delivery_tag}")));
        }
        state.acked.push(delivery_tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RmqConfig;
    use crate::setup::setup;
    use crate::transport::{DeliveryMode, DELAY_HEADER};

    fn message(body: &str, delay_ms: u64) -> Publishing {
        let mut headers = Headers::new();
        headers.insert(DELAY_HEADER.to_owned(), delay_ms.into());
        Publishing {
            delivery_mode: DeliveryMode::Persistent,
            content_type: "text/json".to_owned(),
            headers,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("jobs.ping", "jobs.ping"));
        assert!(!topic_matches("jobs.ping", "jobs.pong"));
        assert!(topic_matches("jobs.*", "jobs.ping"));
        assert!(!topic_matches("jobs.*", "jobs.ping.fast"));
        assert!(topic_matches("jobs.#", "jobs.ping.fast"));
        assert!(topic_matches("jobs.#", "jobs"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("*.ping", "ping"));
    }

    async fn declared() -> (MemoryBroker, Arc<dyn Channel>) {
        let broker = MemoryBroker::new();
        let connection = broker.connector().dial().await.unwrap();
        let channel = connection.channel().await.unwrap();
        setup(channel.as_ref(), "delayed", &[RmqConfig::new("q", "jobs.*")])
            .await
            .unwrap();
        (broker, channel)
    }

    #[tokio::test]
    async fn routes_to_bound_consumer_and_records_acks() {
        let (broker, channel) = declared().await;
        let mut deliveries = channel
            .consume("q", "q-consumer", ConsumeOptions::manual_ack())
            .await
            .unwrap();

        channel.publish("delayed", "jobs.ping", &message("hello", 0)).await.unwrap();
        channel.publish("delayed", "other.key", &message("lost", 0)).await.unwrap();

        let delivery = deliveries.recv().await.expect("delivery");
        assert_eq!(delivery.body, b"hello");
        assert_eq!(delivery.consumer_tag, "q-consumer");
        delivery.ack().await.unwrap();
        assert_eq!(broker.acked(), vec![delivery.delivery_tag]);
        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn honors_delay_header() {
        let (broker, channel) = declared().await;
        channel.publish("delayed", "jobs.ping", &message("later", 5_000)).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn closing_the_channel_ends_the_stream() {
        let (broker, channel) = declared().await;
        let mut deliveries = channel
            .consume("q", "tag", ConsumeOptions::manual_ack())
            .await
            .unwrap();
        assert_eq!(broker.consumer_count("q"), 1);

        channel.close().await;
        assert!(deliveries.recv().await.is_none());
        assert!(channel.publish("delayed", "jobs.ping", &message("x", 0)).await.is_err());
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered_after_channel_close() {
        let (broker, channel) = declared().await;
        let mut first = channel
            .consume("q", "first", ConsumeOptions::manual_ack())
            .await
            .unwrap();
        channel.publish("delayed", "jobs.ping", &message("once", 0)).await.unwrap();

        let delivery = first.recv().await.expect("delivery");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(), 1);

        channel.close().await;
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(delivery.ack().await.is_err());

        let other = broker.connector().dial().await.unwrap().channel().await.unwrap();
        let mut second = other
            .consume("q", "second", ConsumeOptions::manual_ack())
            .await
            .unwrap();
        let again = second.recv().await.expect("redelivery");
        assert_eq!(again.body, b"once");
        assert!(again.redelivered);
        again.ack().await.unwrap();
        assert_eq!(broker.acked(), vec![again.delivery_tag]);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn buffered_deliveries_return_in_order_when_the_connection_closes() {
        let broker = MemoryBroker::new();
        let connection = broker.connector().dial().await.unwrap();
        let channel = connection.channel().await.unwrap();
        setup(channel.as_ref(), "delayed", &[RmqConfig::new("q", "jobs.*")])
            .await
            .unwrap();
        let deliveries = channel
            .consume("q", "first", ConsumeOptions::manual_ack())
            .await
            .unwrap();
        for body in ["a", "b", "c"] {
            channel.publish("delayed", "jobs.ping", &message(body, 0)).await.unwrap();
        }
        // Never read; the consumer goes away with three deliveries buffered.
        drop(deliveries);
        connection.close().await;
        assert_eq!(broker.queue_depth("q"), 3);

        let other = broker.connector().dial().await.unwrap().channel().await.unwrap();
        let mut second = other
            .consume("q", "second", ConsumeOptions::manual_ack())
            .await
            .unwrap();
        let mut bodies = Vec::new();
        for _ in 0..3 {
            let delivery = second.recv().await.expect("redelivery");
            assert!(delivery.redelivered);
            bodies.push(String::from_utf8(delivery.body.clone()).unwrap());
            delivery.ack().await.unwrap();
        }
        assert_eq!(bodies, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(1);
        assert!(broker.connector().dial().await.is_err());
        let connection = broker.connector().dial().await.unwrap();
        assert_eq!(broker.dial_count(), 1);

        broker.fail_next_channels(1);
        assert!(connection.channel().await.is_err());
        assert!(connection.channel().await.is_ok());
    }
}
