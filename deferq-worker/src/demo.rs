//! In-process demo: wires the configuration to an in-memory backend and
//! runs a recurring `Ping` job for a while.

use std::sync::Arc;
use std::time::Duration;

use deferq_config::{Backend, Config};
use deferq_core::{async_trait, Executor, Job, JobError, Scheduler};
use deferq_rmq::memory::MemoryBroker;
use deferq_rmq::{RmqConfig, RmqDoer};
use deferq_sqs::memory::MemoryQueueService;
use deferq_sqs::{region_id, SqsConfig, SqsDoer, SqsRegions};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEMO_ROUTING_KEY: &str = "deferq.demo.ping";
pub const DEMO_REGION: &str = "USEast";
const DEMO_INTERVAL_MS: u64 = 1_000;
const DEMO_RECEIVE_WAIT: Duration = Duration::from_millis(200);

/// Counts its own runs in the job payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Ping {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(default)]
    pub runs: u64,
}

#[async_trait]
impl Executor for Ping {
    async fn execute(&mut self, job: &mut Job) -> Result<(), JobError> {
        self.runs += 1;
        info!(job_id = %job.id, name = %self.name, runs = self.runs, "ping");
        job.job_data.insert("runs".into(), self.runs.into());
        Ok(())
    }
}

/// What the demo observed on the in-memory backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemoReport {
    pub backend: Backend,
    pub job_id: String,
    /// Messages put on the queue, the initial enqueue included.
    pub sent: usize,
    /// Messages taken off the queue by the monitor.
    pub received: usize,
}

/// Fill in what the demo needs but a bare configuration leaves empty.
pub fn apply_demo_defaults(config: &mut Config) {
    if config.monitor.backend == Backend::Sqs && config.monitor.region_name.is_empty() {
        config.monitor.region_name = DEMO_REGION.to_string();
    }
}

fn demo_job(config: &Config) -> Job {
    Job::new(uuid::Uuid::new_v4().to_string(), "Ping")
        .with_interval(DEMO_INTERVAL_MS)
        .with_routing_key(DEMO_ROUTING_KEY)
        .on_queue(config.monitor.queue_name.clone())
        .in_region(config.monitor.region_name.clone())
        .recurring(true)
        .with_field("Name", "deferq")
}

pub async fn run(config: &Config, duration: Duration) -> anyhow::Result<DemoReport> {
    match config.monitor.backend {
        Backend::Rabbitmq => run_rabbitmq(config, duration).await,
        Backend::Sqs => run_sqs(config, duration).await,
    }
}

async fn run_rabbitmq(config: &Config, duration: Duration) -> anyhow::Result<DemoReport> {
    let broker = MemoryBroker::new();
    let doer = RmqDoer::connect(broker.connector(), config.rmq_settings()).await?;

    let mut queues = config.rabbitmq.queues.clone();
    queues.push(RmqConfig::new(config.monitor.queue_name.clone(), DEMO_ROUTING_KEY));
    deferq_rmq::setup(doer.publisher_channel().await.as_ref(), &doer.settings().exchange, &queues).await?;

    let mut scheduler = Scheduler::new();
    scheduler.register_executor::<Ping>("Ping").register_doer(doer);

    let job = demo_job(config);
    let job_id = job.id.clone();
    drive(&scheduler, config, &job, duration).await?;

    Ok(DemoReport {
        backend: Backend::Rabbitmq,
        job_id,
        sent: broker.published().len(),
        received: broker.acked().len(),
    })
}

async fn run_sqs(config: &Config, duration: Duration) -> anyhow::Result<DemoReport> {
    let region = config.monitor.region_name.as_str();
    let native = region_id(region).ok_or_else(|| anyhow::anyhow!("unknown region {region}"))?;
    let service = Arc::new(MemoryQueueService::new(native).with_receive_wait(DEMO_RECEIVE_WAIT));
    let mut regions = SqsRegions::init_all(|id| {
        Arc::new(MemoryQueueService::new(id).with_receive_wait(DEMO_RECEIVE_WAIT))
    });
    regions.insert(region, service.clone());

    let mut queues = config.sqs.queues.clone();
    queues.push(SqsConfig::new(region, config.monitor.queue_name.clone(), 0));
    deferq_sqs::setup(&regions, &queues).await?;

    let mut scheduler = Scheduler::new();
    scheduler
        .register_executor::<Ping>("Ping")
        .register_doer(SqsDoer::new(regions, config.sqs_settings()));

    let job = demo_job(config);
    let job_id = job.id.clone();
    drive(&scheduler, config, &job, duration).await?;

    let queue = service
        .queue(&config.monitor.queue_name)
        .ok_or_else(|| anyhow::anyhow!("demo queue disappeared"))?;
    Ok(DemoReport {
        backend: Backend::Sqs,
        job_id,
        sent: queue.sent().len(),
        received: queue.deleted_messages(),
    })
}

/// Enqueue `job`, monitor for `duration`, then stop the monitor.
async fn drive(scheduler: &Scheduler, config: &Config, job: &Job, duration: Duration) -> anyhow::Result<()> {
    scheduler.enqueue(job).await?;
    info!(job_id = %job.id, backend = %config.monitor.backend, "demo job enqueued");

    let monitor = scheduler.spawn_monitor(config.monitor_config());
    tokio::time::sleep(duration).await;
    if monitor.is_finished() {
        // Only an error ends a monitor early.
        monitor.await??;
    } else {
        monitor.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rabbitmq_demo_cycles_the_job() {
        let config = Config::default();
        let report = run(&config, Duration::from_millis(3_500)).await.expect("demo");

        assert_eq!(report.backend, Backend::Rabbitmq);
        assert_eq!(report.received, 3);
        assert_eq!(report.sent, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sqs_demo_cycles_the_job() {
        let mut config = Config::default();
        config.monitor.backend = Backend::Sqs;
        apply_demo_defaults(&mut config);
        assert_eq!(config.monitor.region_name, DEMO_REGION);

        let report = run(&config, Duration::from_millis(1_500)).await.expect("demo");
        assert_eq!(report.backend, Backend::Sqs);
        assert_eq!(report.received, 1);
        assert_eq!(report.sent, 2);
    }
}
