//! Poll backend: a receive loop feeding a processing loop through a bounded
//! buffer.
//!
//! Messages are deleted from the source queue as soon as they are received,
//! before the job runs. Delivery is therefore at most once: a crash between
//! the delete and the end of processing loses the job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferq_core::{execute_contained, Doer, ExecutorRegistry, Job, MonitorConfig, Outcome, QueueError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{GateMiss, SqsSettings};
use crate::error::SqsError;
use crate::regions::SqsRegions;
use crate::setup::MAX_QUEUE_DELAY;
use crate::transport::{CloudQueue, QueueMessage};

/// Delay in whole seconds for an interval in milliseconds, clamped to
/// [`MAX_QUEUE_DELAY`].
pub fn delay_seconds(interval_ms: u64) -> u32 {
    u32::try_from(interval_ms / 1000).map_or(MAX_QUEUE_DELAY, |secs| secs.min(MAX_QUEUE_DELAY))
}

/// Whole seconds left until `exec_time`, rounded up and clamped.
fn remaining_delay(exec_time: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let remaining_ms = (exec_time - now).num_milliseconds().max(0);
    let secs = (remaining_ms + 999) / 1000;
    u32::try_from(secs).map_or(MAX_QUEUE_DELAY, |s| s.min(MAX_QUEUE_DELAY))
}

/// What became of one buffered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Not a job; discarded.
    Malformed,
    /// Received before its execution time.
    Deferred,
    Executed,
}

/// Transport backed by a polled cloud queue.
#[derive(Clone)]
pub struct SqsDoer {
    regions: Arc<SqsRegions>,
    settings: Arc<SqsSettings>,
}

impl SqsDoer {
    pub fn new(regions: SqsRegions, settings: SqsSettings) -> Self {
        Self::with_shared_regions(Arc::new(regions), settings)
    }

    pub fn with_shared_regions(regions: Arc<SqsRegions>, settings: SqsSettings) -> Self {
        info!("registering job scheduler with sqs");
        Self {
            regions,
            settings: Arc::new(settings),
        }
    }

    #[inline]
    pub fn regions(&self) -> &SqsRegions {
        &self.regions
    }

    #[inline]
    pub fn settings(&self) -> &SqsSettings {
        &self.settings
    }

    async fn resolve(&self, region_name: &str, queue_name: &str) -> Result<Arc<dyn CloudQueue>, SqsError> {
        let service = self.regions.service(region_name).map_err(|err| {
            error!(region = %region_name, error = %err, "error getting region");
            err
        })?;
        service.get_queue(queue_name).await.map_err(|err| {
            error!(region = %region_name, queue = %queue_name, error = %err, "error getting queue");
            err
        })
    }

    /// Poll one message at a time, delete it and hand it to the buffer.
    /// Returns only once the processing side has gone away.
    async fn receive_loop(&self, queue: Arc<dyn CloudQueue>, buffer: mpsc::Sender<QueueMessage>) {
        loop {
            let mut messages = match queue.receive_messages(1).await {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(queue = %queue.name(), error = %err, "error getting message");
                    tokio::time::sleep(self.settings.receive_error_backoff()).await;
                    continue;
                }
            };
            let Some(message) = messages.pop() else {
                debug!(queue = %queue.name(), "no messages received");
                continue;
            };

            if let Err(err) = queue.delete_message(&message).await {
                // Left in place; it becomes visible again after the timeout.
                warn!(queue = %queue.name(), message_id = %message.message_id, error = %err, "error deleting message");
                continue;
            }
            debug!(queue = %queue.name(), message_id = %message.message_id, "deleted message");

            if buffer.send(message).await.is_err() {
                error!(queue = %queue.name(), "processing loop stopped, dropping message");
                return;
            }
        }
    }

    async fn process_loop(&self, registry: Arc<ExecutorRegistry>, source: Arc<dyn CloudQueue>, mut buffer: mpsc::Receiver<QueueMessage>) {
        while let Some(message) = buffer.recv().await {
            self.process(&registry, source.as_ref(), &message.body).await;
        }
    }

    async fn process(&self, registry: &ExecutorRegistry, source: &dyn CloudQueue, body: &str) -> Step {
        let job = match Job::from_wire(body.as_bytes()) {
            Ok(job) => job,
            Err(err) => {
                error!(queue = %source.name(), error = %err, "error unmarshalling job");
                return Step::Malformed;
            }
        };

        let now = Utc::now();
        debug!(job_id = %job.id, job_type = %job.job_type, %now, exec_time = %job.exec_time, "checking execution time");
        if !job.is_due(now, self.settings.gate_tolerance()) {
            self.gate_missed(source, &job, body, now).await;
            return Step::Deferred;
        }

        let execution = execute_contained(registry, job).await;
        let mut job = execution.job;
        let succeeded = execution.outcome.is_success();
        match execution.outcome {
            Outcome::Succeeded => info!(job_id = %job.id, job_type = %job.job_type, "successfully executed job"),
            Outcome::Failed(err) => error!(job_id = %job.id, job_type = %job.job_type, error = %err, "error executing job"),
            Outcome::Undispatchable(err) => error!(job_id = %job.id, error = %err, "no executor for job"),
            Outcome::Aborted(reason) => error!(job_id = %job.id, job_type = %job.job_type, %reason, "job aborted"),
        }
        job.schedule_after(Utc::now());

        if succeeded && job.is_recurring {
            info!(job_id = %job.id, job_type = %job.job_type, exec_time = %job.exec_time, "next exec time for job");
            if let Err(err) = self.enqueue(&job).await {
                error!(job_id = %job.id, error = %err, "error enqueuing job, dropping it");
            }
        }
        Step::Executed
    }

    async fn gate_missed(&self, source: &dyn CloudQueue, job: &Job, body: &str, now: DateTime<Utc>) {
        match self.settings.gate_miss {
            GateMiss::Drop => {
                warn!(job_id = %job.id, job_type = %job.job_type, exec_time = %job.exec_time, "job not executed as exec time is later, dropping it");
            }
            GateMiss::Requeue => {
                let delay = remaining_delay(job.exec_time, now);
                debug!(job_id = %job.id, delay_secs = delay, "job received early, requeueing");
                if let Err(err) = source.send_message(body, delay).await {
                    error!(job_id = %job.id, queue = %source.name(), error = %err, "error requeueing early job, dropping it");
                }
            }
        }
    }
}

#[async_trait]
impl Doer for SqsDoer {
    fn name(&self) -> &str {
        "sqs"
    }

    /// Send to `job.queue` in `job.queue_region`, held back for the job's
    /// interval (at most fifteen minutes).
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        if job.queue.is_empty() || job.queue_region.is_empty() {
            error!(job_id = %job.id, queue = %job.queue, region = %job.queue_region, "job has no destination queue");
            return Err(QueueError::InvalidJob(format!("job {} is missing its queue or region", job.id)));
        }
        let queue = self.resolve(&job.queue_region, &job.queue).await?;
        let body = serde_json::to_string(job)?;
        let delay = delay_seconds(job.interval);
        debug!(job_id = %job.id, %body, "message being sent");
        match queue.send_message(&body, delay).await {
            Ok(message_id) => {
                info!(job_id = %job.id, job_type = %job.job_type, %message_id, delay_secs = delay, "enqueued job");
                Ok(())
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "error sending message");
                Err(err.into())
            }
        }
    }

    /// Receive from `config.queue_name` in `config.region_name` forever.
    /// Fails up front when the region or queue cannot be resolved.
    async fn monitor(&self, registry: Arc<ExecutorRegistry>, config: MonitorConfig) -> Result<(), QueueError> {
        let queue = self.resolve(&config.region_name, &config.queue_name).await?;
        info!(queue = %config.queue_name, region = %config.region_name, "monitoring queue");
        Err(self.run(registry, queue).await)
    }
}

impl SqsDoer {
    /// Run both loops against `queue` until either one stops.
    async fn run(&self, registry: Arc<ExecutorRegistry>, queue: Arc<dyn CloudQueue>) -> QueueError {
        let (tx, rx) = mpsc::channel(self.settings.buffer_capacity.max(1));
        let mut processor = {
            let doer = self.clone();
            let source = queue.clone();
            tokio::spawn(async move { doer.process_loop(registry, source, rx).await })
        };

        tokio::select! {
            () = self.receive_loop(queue.clone(), tx) => processor.abort(),
            result = &mut processor => {
                if let Err(err) = result {
                    error!(queue = %queue.name(), error = %err, "processing loop failed");
                }
            }
        }
        QueueError::Backend(format!("processing loop for '{}' stopped", queue.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryQueue, MemoryQueueService};
    use crate::setup::{setup, SqsConfig};
    use chrono::Duration;
    use deferq_core::{async_trait, Executor, JobError};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    const REGION: &str = "APSoutheast";
    const QUEUE: &str = "test-queue";

    #[derive(Default, Serialize, Deserialize)]
    struct Ping {
        #[serde(rename = "Name")]
        name: String,
        #[serde(default)]
        fail: bool,
        #[serde(default)]
        explode: bool,
    }

    #[async_trait]
    impl Executor for Ping {
        async fn execute(&mut self, job: &mut Job) -> Result<(), JobError> {
            if self.explode {
                panic!("exploded");
            }
            if self.fail {
                return Err(JobError::failed("asked to fail"));
            }
            job.job_data.insert("seen".into(), json!(self.name));
            Ok(())
        }
    }

    async fn doer(settings: SqsSettings) -> (SqsDoer, Arc<MemoryQueue>) {
        let service = Arc::new(MemoryQueueService::new("ap-southeast-1"));
        let mut regions = SqsRegions::new();
        regions.insert(REGION, service.clone());
        setup(&regions, &[SqsConfig::new(REGION, QUEUE, 0)])
            .await
            .expect("setup");
        let queue = service.queue(QUEUE).expect("queue");
        (SqsDoer::new(regions, settings), queue)
    }

    fn registry() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        registry.register::<Ping>("Ping");
        registry
    }

    fn ping(id: &str) -> Job {
        Job::new(id, "Ping")
            .with_interval(5000)
            .on_queue(QUEUE)
            .in_region(REGION)
            .recurring(true)
            .with_field("Name", "Ada")
    }

    async fn process(doer: &SqsDoer, queue: &MemoryQueue, job: &Job) -> Step {
        let body = serde_json::to_string(job).unwrap();
        doer.process(&registry(), queue, &body).await
    }

    #[test]
    fn delay_is_clamped_to_the_window() {
        assert_eq!(delay_seconds(1_000_000), MAX_QUEUE_DELAY);
        assert_eq!(delay_seconds(5_000), 5);
        assert_eq!(delay_seconds(999), 0);
        assert_eq!(delay_seconds(u64::MAX), MAX_QUEUE_DELAY);
    }

    #[test]
    fn remaining_delay_rounds_up() {
        let now = Utc::now();
        assert_eq!(remaining_delay(now + Duration::milliseconds(1_200), now), 2);
        assert_eq!(remaining_delay(now - Duration::seconds(5), now), 0);
        assert_eq!(remaining_delay(now + Duration::hours(2), now), MAX_QUEUE_DELAY);
    }

    #[tokio::test]
    async fn enqueue_sends_with_interval_delay() {
        let (doer, queue) = doer(SqsSettings::default()).await;
        doer.enqueue(&ping("j1")).await.expect("enqueue");

        let sent = queue.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].delay_seconds, 5);
        assert_eq!(Job::from_wire(sent[0].body.as_bytes()).unwrap().id, "j1");
    }

    #[tokio::test]
    async fn enqueue_to_unknown_region_fails() {
        let (doer, _) = doer(SqsSettings::default()).await;
        let err = doer.enqueue(&ping("j1").in_region("Mars")).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownRegion(_)));
    }

    #[tokio::test]
    async fn due_recurring_job_is_executed_and_re_enqueued() {
        let (doer, queue) = doer(SqsSettings::default()).await;
        let before = Utc::now();

        assert_eq!(process(&doer, &queue, &ping("j1")).await, Step::Executed);

        let sent = queue.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].delay_seconds, 5);
        let next = Job::from_wire(sent[0].body.as_bytes()).unwrap();
        assert!(next.exec_time >= before + Duration::milliseconds(5000));
        assert!(next.exec_time <= Utc::now() + Duration::milliseconds(5000));
        assert_eq!(next.job_data["seen"], json!("Ada"));
    }

    #[tokio::test]
    async fn failed_panicking_and_one_shot_jobs_are_not_re_enqueued() {
        let (doer, queue) = doer(SqsSettings::default()).await;

        process(&doer, &queue, &ping("f").with_field("fail", true)).await;
        process(&doer, &queue, &ping("p").with_field("explode", true)).await;
        process(&doer, &queue, &ping("o").recurring(false)).await;
        process(&doer, &queue, &Job::new("u", "Unknown").recurring(true)).await;

        assert!(queue.sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_discarded() {
        let (doer, queue) = doer(SqsSettings::default()).await;
        let step = doer.process(&registry(), queue.as_ref(), "{not json").await;
        assert_eq!(step, Step::Malformed);
        assert!(queue.sent().is_empty());
    }

    #[tokio::test]
    async fn early_job_is_requeued_for_the_remaining_time() {
        let (doer, queue) = doer(SqsSettings::default()).await;
        let early = ping("e").at(Utc::now() + Duration::seconds(60));
        let body = serde_json::to_string(&early).unwrap();

        assert_eq!(doer.process(&registry(), queue.as_ref(), &body).await, Step::Deferred);

        let sent = queue.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, body);
        assert!((59..=60).contains(&sent[0].delay_seconds));
    }

    #[tokio::test]
    async fn early_job_is_dropped_when_configured() {
        let (doer, queue) = doer(SqsSettings::default().with_gate_miss(GateMiss::Drop)).await;
        let early = ping("e").at(Utc::now() + Duration::seconds(60));

        assert_eq!(process(&doer, &queue, &early).await, Step::Deferred);
        assert!(queue.sent().is_empty());
    }

    #[tokio::test]
    async fn tolerance_lets_a_job_run_early() {
        let settings = SqsSettings::default().with_gate_tolerance(std::time::Duration::from_secs(60));
        let (doer, queue) = doer(settings).await;
        let early = ping("e").at(Utc::now() + Duration::seconds(30));

        assert_eq!(process(&doer, &queue, &early).await, Step::Executed);
    }

    #[tokio::test]
    async fn job_runs_once_the_gate_opens() {
        let (doer, queue) = doer(SqsSettings::default().with_gate_miss(GateMiss::Drop)).await;
        let job = ping("g").at(Utc::now() + Duration::milliseconds(300));

        assert_eq!(process(&doer, &queue, &job).await, Step::Deferred);
        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        assert_eq!(process(&doer, &queue, &job).await, Step::Executed);
        assert_eq!(queue.sent().len(), 1);
    }

    #[tokio::test]
    async fn monitor_fails_for_unknown_queue() {
        let (doer, _) = doer(SqsSettings::default()).await;
        let err = doer
            .monitor(Arc::new(registry()), MonitorConfig::new("missing").in_region(REGION))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Backend(_)));

        let err = doer
            .monitor(Arc::new(registry()), MonitorConfig::new(QUEUE).in_region("Mars"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownRegion(_)));
    }

    #[tokio::test]
    async fn enqueue_requires_queue_and_region() {
        let (doer, queue) = doer(SqsSettings::default()).await;

        let err = doer.enqueue(&ping("j1").in_region("")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidJob(_)));
        let err = doer.enqueue(&ping("j2").on_queue("")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidJob(_)));
        assert!(queue.sent().is_empty());
    }

    #[derive(Default, Serialize, Deserialize)]
    struct Slow {}

    #[async_trait]
    impl Executor for Slow {
        async fn execute(&mut self, _job: &mut Job) -> Result<(), JobError> {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_buffer_holds_back_the_receive_loop() {
        let (doer, queue) = doer(SqsSettings::default().with_buffer_capacity(1)).await;
        for i in 0..5 {
            let job = Job::new(format!("s{i}"), "Slow").on_queue(QUEUE).in_region(REGION);
            doer.enqueue(&job).await.expect("enqueue");
        }
        let mut registry = ExecutorRegistry::new();
        registry.register::<Slow>("Slow");

        let monitor = {
            let doer = doer.clone();
            tokio::spawn(async move {
                doer.monitor(Arc::new(registry), MonitorConfig::new(QUEUE).in_region(REGION))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        // One running, one buffered, one waiting in the receive loop.
        assert_eq!(queue.deleted_messages(), 3);
        assert_eq!(queue.len(), 2);
        monitor.abort();
    }

    /// Delegates to a memory queue but panics on send.
    struct SendPanics(Arc<MemoryQueue>);

    #[async_trait]
    impl CloudQueue for SendPanics {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn receive_messages(&self, max: usize) -> Result<Vec<QueueMessage>, SqsError> {
            self.0.receive_messages(max).await
        }

        async fn delete_message(&self, message: &QueueMessage) -> Result<(), SqsError> {
            self.0.delete_message(message).await
        }

        async fn send_message(&self, _body: &str, _delay_seconds: u32) -> Result<String, SqsError> {
            panic!("send exploded");
        }

        async fn delete(&self) -> Result<(), SqsError> {
            self.0.delete().await
        }
    }

    #[tokio::test]
    async fn monitor_ends_when_the_processing_loop_stops() {
        let (doer, queue) = doer(SqsSettings::default()).await;
        let early = ping("e").at(Utc::now() + Duration::seconds(60));
        queue
            .send_message(&serde_json::to_string(&early).unwrap(), 0)
            .await
            .unwrap();

        // Requeueing the early job panics outside the executor boundary.
        let err = doer
            .run(Arc::new(registry()), Arc::new(SendPanics(queue.clone())))
            .await;
        assert!(matches!(err, QueueError::Backend(_)));
        assert_eq!(queue.deleted_messages(), 1);
    }
}
