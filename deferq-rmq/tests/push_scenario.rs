use std::sync::Arc;
use std::time::Duration;

use deferq_core::{async_trait, Executor, Job, JobError, MonitorConfig, Scheduler};
use deferq_rmq::memory::MemoryBroker;
use deferq_rmq::{setup, RmqConfig, RmqDoer, RmqSettings};
use serde::{Deserialize, Serialize};
use serde_json::json;

const QUEUE: &str = "ping-queue";
const ROUTING_KEY: &str = "jobs.ping";

#[derive(Default, Serialize, Deserialize)]
struct Ping {
    #[serde(rename = "Name")]
    name: String,
}

#[async_trait]
impl Executor for Ping {
    async fn execute(&mut self, job: &mut Job) -> Result<(), JobError> {
        job.job_data.insert("seen".into(), json!(self.name));
        Ok(())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Boom {}

#[async_trait]
impl Executor for Boom {
    async fn execute(&mut self, _job: &mut Job) -> Result<(), JobError> {
        panic!("boom");
    }
}

async fn connected(broker: &MemoryBroker, settings: RmqSettings) -> RmqDoer {
    let doer = RmqDoer::connect(broker.connector(), settings)
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

async fn scheduler(broker: &MemoryBroker, settings: RmqSettings) -> Scheduler {
    with_doer(connected(broker, settings).await)
}

fn with_doer(doer: RmqDoer) -> Scheduler {
    let mut scheduler = Scheduler::new();
    scheduler
        .register_executor::<Ping>("Ping")
        .register_executor::<Boom>("Boom")
        .register_doer(doer);
    scheduler
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn job(id: &str, job_type: &str) -> Job {
    Job::new(id, job_type)
        .with_interval(1000)
        .with_routing_key(ROUTING_KEY)
        .on_queue(QUEUE)
        .recurring(true)
        .with_field("Name", "Ada")
}

#[tokio::test(start_paused = true)]
async fn recurring_job_runs_and_is_published_again() {
    let broker = MemoryBroker::new();
    let scheduler = scheduler(&broker, RmqSettings::default()).await;
    let first = job("j1", "Ping");

    scheduler.enqueue(&first).await.expect("enqueue");
    let monitor = scheduler.spawn_monitor(MonitorConfig::new(QUEUE));

    // Held back by the exchange for one interval.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(broker.acked().is_empty());

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(broker.acked().len(), 1);

    let published = broker.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].message.delay_ms(), 1000);
    let next = Job::from_wire(&published[1].message.body).expect("job");
    assert_eq!(next.id, "j1");
    assert_eq!(next.exec_time - first.exec_time, chrono::Duration::milliseconds(1000));
    assert_eq!(next.job_data["seen"], json!("Ada"));

    // And once more after the next interval.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(broker.acked().len(), 2);
    assert_eq!(broker.published().len(), 3);

    monitor.abort();
}

#[tokio::test(start_paused = true)]
async fn panicking_job_does_not_stop_the_consumer() {
    let broker = MemoryBroker::new();
    let scheduler = scheduler(&broker, RmqSettings::default()).await;

    scheduler.enqueue(&job("boom", "Boom")).await.expect("enqueue");
    scheduler.enqueue(&job("ping", "Ping")).await.expect("enqueue");
    let monitor = scheduler.spawn_monitor(MonitorConfig::new(QUEUE));

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    // Both deliveries acked; only the successful job recurs.
    assert_eq!(broker.acked().len(), 2);
    let ids: Vec<String> = broker
        .published()
        .iter()
        .skip(2)
        .map(|p| Job::from_wire(&p.message.body).expect("job").id)
        .collect();
    assert_eq!(ids, vec!["ping".to_owned()]);
    assert!(!monitor.is_finished());

    monitor.abort();
}

#[tokio::test(start_paused = true)]
async fn monitor_rebuilds_the_link_after_the_consumer_is_cancelled() {
    let broker = MemoryBroker::new();
    let settings = RmqSettings::default().with_restart_delay(Duration::from_millis(100));
    let doer = connected(&broker, settings).await;
    let scheduler = with_doer(doer.clone());
    let monitor = scheduler.spawn_monitor(MonitorConfig::new(QUEUE));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.consumer_count(QUEUE), 1);
    assert_eq!(broker.dial_count(), 1);
    let old_connection = doer.connection().await;
    let old_consumer = doer.consumer_channel().await;

    broker.drop_consumers();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.dial_count(), 2);
    assert_eq!(broker.consumer_count(QUEUE), 1);
    assert!(!same(&old_connection, &doer.connection().await));
    assert!(!same(&old_consumer, &doer.consumer_channel().await));

    // The rebuilt link both publishes and consumes.
    scheduler
        .enqueue(&job("after", "Ping").recurring(false))
        .await
        .expect("enqueue");
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(broker.acked().len(), 1);

    monitor.abort();
}

#[tokio::test(start_paused = true)]
async fn monitor_returns_when_the_broker_cannot_be_redialed() {
    let broker = MemoryBroker::new();
    let settings = RmqSettings::default().with_restart_delay(Duration::from_millis(100));
    let scheduler = scheduler(&broker, settings).await;
    let monitor = scheduler.spawn_monitor(MonitorConfig::new(QUEUE));

    tokio::time::sleep(Duration::from_millis(10)).await;
    broker.fail_next_dials(1);
    broker.drop_consumers();

    let result = monitor.await.expect("monitor task");
    let err = result.unwrap_err();
    assert!(err.is_connectivity());
}
