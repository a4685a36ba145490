//! Push backend: delayed-exchange publishing and the consume loop.

use std::sync::Arc;

use async_trait::async_trait;
use deferq_core::{execute_contained, Doer, ExecutorRegistry, Job, MonitorConfig, Outcome, QueueError};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RmqSettings;
use crate::error::BrokerError;
use crate::link::BrokerLink;
use crate::transport::{
    Channel, Connection, Connector, ConsumeOptions, Delivery, DeliveryMode, Headers, Publishing,
    DELAY_HEADER,
};

const CONTENT_TYPE: &str = "text/json";

/// What the consume loop should do after a delivery has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Done,
    /// Re-enqueueing hit a broker failure; rebuild the link.
    Restart,
}

/// Transport backed by a broker with a delayed-message exchange.
///
/// Cloning is cheap; all clones share one connection and channel pair.
#[derive(Clone)]
pub struct RmqDoer {
    link: Arc<BrokerLink>,
    settings: Arc<RmqSettings>,
}

impl RmqDoer {
    /// Dial the broker and open the publisher and consumer channels.
    pub async fn connect(connector: Arc<dyn Connector>, settings: RmqSettings) -> Result<Self, BrokerError> {
        let link = BrokerLink::open(connector).await?;
        info!(exchange = %settings.exchange, "registering job scheduler with broker");
        Ok(Self {
            link: Arc::new(link),
            settings: Arc::new(settings),
        })
    }

    #[inline]
    pub fn settings(&self) -> &RmqSettings {
        &self.settings
    }

    /// The live connection. Treat as read-only; it may be replaced at any time.
    pub async fn connection(&self) -> Arc<dyn Connection> {
        self.link.connection().await
    }

    /// The live publisher channel, e.g. for running [`crate::setup`].
    pub async fn publisher_channel(&self) -> Arc<dyn Channel> {
        self.link.publisher().await
    }

    pub async fn consumer_channel(&self) -> Arc<dyn Channel> {
        self.link.consumer().await
    }

    async fn publish(&self, job: &Job) -> Result<(), QueueError> {
        if job.routing_key.is_empty() {
            return Err(QueueError::InvalidJob(format!("job {} has no routing key", job.id)));
        }
        let message = publishing_for(job)?;
        let exchange = self.settings.exchange.as_str();

        let publisher = self.link.publisher().await;
        if let Err(err) = publisher.publish(exchange, &job.routing_key, &message).await {
            warn!(job_id = %job.id, error = %err, "publish failed, recreating publisher channel");
            let publisher = self.link.recover_publisher(&publisher).await?;
            publisher.publish(exchange, &job.routing_key, &message).await?;
        }
        Ok(())
    }

    async fn consume(&self, registry: &Arc<ExecutorRegistry>, queue: &str) {
        info!(%queue, "starting consumer");
        let consumer_tag = format!("{queue}-consumer");
        let channel = self.link.consumer().await;
        let mut deliveries = match channel
            .consume(queue, &consumer_tag, ConsumeOptions::manual_ack())
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(%queue, error = %err, "queue consumer could not be initiated");
                return;
            }
        };

        let (restart_tx, mut restart_rx) = mpsc::channel::<()>(1);
        loop {
            tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => {
                        debug!(consumer = %delivery.consumer_tag, tag = delivery.delivery_tag, redelivered = delivery.redelivered, "received message to execute");
                        let doer = self.clone();
                        let registry = registry.clone();
                        let restart = restart_tx.clone();
                        tokio::spawn(async move {
                            doer.handle_delivery(&registry, delivery, restart).await;
                        });
                    }
                    None => {
                        warn!(%queue, "delivery stream closed");
                        return;
                    }
                },
                Some(()) = restart_rx.recv() => {
                    warn!(%queue, "broker failure while re-enqueueing, restarting consumer");
                    return;
                }
            }
        }
    }

    async fn handle_delivery(&self, registry: &ExecutorRegistry, delivery: Delivery, restart: mpsc::Sender<()>) {
        let disposition = self.process(registry, &delivery.body).await;

        // Always ack: a message that has been attempted is never redelivered.
        if let Err(err) = delivery.ack().await {
            warn!(tag = delivery.delivery_tag, consumer = %delivery.consumer_tag, error = %err, "failed to ack delivery");
        } else {
            debug!(tag = delivery.delivery_tag, consumer = %delivery.consumer_tag, "ack delivery");
        }

        if disposition == Disposition::Restart {
            // A full buffer means a restart is already pending.
            let _ = restart.try_send(());
        }
    }

    async fn process(&self, registry: &ExecutorRegistry, body: &[u8]) -> Disposition {
        let job = match Job::from_wire(body) {
            Ok(job) => job,
            Err(err) => {
                error!(error = %err, "error converting message body to job");
                return Disposition::Done;
            }
        };

        let mut execution = execute_contained(registry, job).await;
        if !matches!(execution.outcome, Outcome::Succeeded) {
            return Disposition::Done;
        }
        info!(job_id = %execution.job.id, job_type = %execution.job.job_type, "successfully executed job");
        if !execution.should_recur() {
            return Disposition::Done;
        }

        if !execution.rescheduled_by_executor() {
            let previous = execution.scheduled_for;
            execution.job.schedule_after(previous);
        }
        let job = &execution.job;
        info!(job_id = %job.id, job_type = %job.job_type, exec_time = %job.exec_time, "re-enqueueing");
        match self.enqueue(job).await {
            Ok(()) => Disposition::Done,
            Err(err) if err.is_connectivity() => {
                error!(job_id = %job.id, error = %err, "broker failure while re-enqueueing");
                Disposition::Restart
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "dropping recurring job");
                Disposition::Done
            }
        }
    }

    async fn rebuild(&self) -> Result<(), BrokerError> {
        self.link.restart_connection().await?;
        self.link.restart_publisher().await?;
        self.link.restart_consumer().await
    }
}

fn publishing_for(job: &Job) -> Result<Publishing, QueueError> {
    let body = job.to_wire()?;
    let mut headers = Headers::new();
    headers.insert(DELAY_HEADER.to_owned(), Value::from(job.interval));
    Ok(Publishing {
        delivery_mode: DeliveryMode::Persistent,
        content_type: CONTENT_TYPE.to_owned(),
        headers,
        body,
    })
}

#[async_trait]
impl Doer for RmqDoer {
    fn name(&self) -> &str {
        "rmq"
    }

    /// Publish with the job's interval as the delay. A failed publish is
    /// retried once on a fresh channel (and connection, if needed).
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        match self.publish(job).await {
            Ok(()) => {
                info!(job_id = %job.id, job_type = %job.job_type, delay_ms = job.interval, "enqueued job");
                Ok(())
            }
            Err(err) => {
                error!(job_id = %job.id, job_type = %job.job_type, error = %err, "failed to enqueue job");
                Err(err)
            }
        }
    }

    /// Consume until the consumer fails, then rebuild connection, publisher
    /// and consumer channel and start over. Returns only when the rebuild
    /// itself fails.
    async fn monitor(&self, registry: Arc<ExecutorRegistry>, config: MonitorConfig) -> Result<(), QueueError> {
        loop {
            self.consume(&registry, &config.queue_name).await;
            tokio::time::sleep(self.settings.restart_delay()).await;
            if let Err(err) = self.rebuild().await {
                error!(queue = %config.queue_name, error = %err, "could not rebuild broker link");
                return Err(err.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RmqConfig;
    use crate::memory::MemoryBroker;
    use crate::setup::setup;
    use chrono::{Duration, Utc};
    use deferq_core::{async_trait, Executor, JobError};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    const QUEUE: &str = "ping-queue";
    const ROUTING_KEY: &str = "jobs.ping";

    #[derive(Default, Serialize, Deserialize)]
    struct Ping {
        #[serde(rename = "Name")]
        name: String,
        #[serde(default)]
        fail: bool,
        #[serde(default)]
        unroute: bool,
    }

    #[async_trait]
    impl Executor for Ping {
        async fn execute(&mut self, job: &mut Job) -> Result<(), JobError> {
            if self.fail {
                return Err(JobError::failed("asked to fail"));
            }
            if self.unroute {
                job.routing_key.clear();
            }
            job.job_data.insert("seen".into(), json!(self.name));
            Ok(())
        }
    }

    async fn doer(broker: &MemoryBroker) -> RmqDoer {
        let doer = RmqDoer::connect(broker.connector(), RmqSettings::default())
            .await
            .expect("connect");
        setup(
            doer.publisher_channel().await.as_ref(),
            &doer.settings().exchange,
            &[RmqConfig::new(QUEUE, ROUTING_KEY)],
        )
        .await
        .expect("setup");
        doer
    }

    fn registry() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        registry.register::<Ping>("Ping");
        registry
    }

    fn ping(id: &str) -> Job {
        Job::new(id, "Ping")
            .with_interval(1000)
            .with_routing_key(ROUTING_KEY)
            .on_queue(QUEUE)
            .recurring(true)
            .with_field("Name", "Ada")
    }

    #[tokio::test]
    async fn enqueue_publishes_with_delay_header() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;

        doer.enqueue(&ping("j1")).await.expect("enqueue");

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, doer.settings().exchange);
        assert_eq!(published[0].routing_key, ROUTING_KEY);
        assert_eq!(published[0].message.delay_ms(), 1000);
        assert_eq!(published[0].message.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(published[0].message.content_type, "text/json");
        assert_eq!(Job::from_wire(&published[0].message.body).unwrap().id, "j1");
    }

    #[tokio::test]
    async fn enqueue_retries_on_fresh_channel() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;
        let before = doer.publisher_channel().await;

        broker.fail_next_publishes(1);
        doer.enqueue(&ping("j1")).await.expect("retry succeeds");

        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.dial_count(), 1);
        assert!(!crate::transport::same_handle(&before, &doer.publisher_channel().await));
    }

    #[tokio::test]
    async fn enqueue_redials_when_channel_cannot_open() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;

        broker.fail_next_publishes(1);
        broker.fail_next_channels(1);
        doer.enqueue(&ping("j1")).await.expect("retry after redial");

        assert_eq!(broker.dial_count(), 2);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn enqueue_gives_up_after_one_retry() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;

        broker.fail_next_publishes(2);
        let err = doer.enqueue(&ping("j1")).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(broker.published().is_empty());

        // The next call goes through on the recovered channel.
        doer.enqueue(&ping("j2")).await.expect("recovered");
    }

    #[tokio::test]
    async fn successful_recurring_job_is_re_enqueued_one_interval_later() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;
        let job = ping("j1").at(Utc::now() + Duration::milliseconds(1000));
        let body = job.to_wire().unwrap();

        let disposition = doer.process(&registry(), &body).await;
        assert_eq!(disposition, Disposition::Done);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let next = Job::from_wire(&published[0].message.body).unwrap();
        assert_eq!(next.id, "j1");
        assert!(next.is_recurring);
        assert_eq!(next.exec_time - job.exec_time, Duration::milliseconds(1000));
        assert_eq!(next.job_data["seen"], json!("Ada"));
    }

    #[tokio::test]
    async fn failed_or_one_shot_jobs_are_not_re_enqueued() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;
        let registry = registry();

        let failing = ping("f").with_field("fail", true);
        doer.process(&registry, &failing.to_wire().unwrap()).await;

        let one_shot = ping("o").recurring(false);
        doer.process(&registry, &one_shot.to_wire().unwrap()).await;

        let unknown = Job::new("u", "Unknown").recurring(true);
        doer.process(&registry, &unknown.to_wire().unwrap()).await;

        assert_eq!(doer.process(&registry, b"not json").await, Disposition::Done);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn broker_failure_on_re_enqueue_requests_restart() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;

        broker.fail_next_publishes(2);
        let disposition = doer.process(&registry(), &ping("j1").to_wire().unwrap()).await;
        assert_eq!(disposition, Disposition::Restart);
    }

    #[tokio::test]
    async fn enqueue_rejects_job_without_routing_key() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;

        let err = doer.enqueue(&Job::new("j1", "Ping")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidJob(_)));
        assert!(!err.is_connectivity());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn non_connectivity_failure_on_re_enqueue_drops_the_job() {
        let broker = MemoryBroker::new();
        let doer = doer(&broker).await;

        let job = ping("j1").with_field("unroute", true);
        let disposition = doer.process(&registry(), &job.to_wire().unwrap()).await;

        assert_eq!(disposition, Disposition::Done);
        assert!(broker.published().is_empty());
        assert_eq!(broker.dial_count(), 1);
    }
}
