//! Core types for the scheduler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::DispatchError;
use crate::executor::Executor;
use crate::registry::ExecutorRegistry;

/// Opaque key/value payload carried with a job.
pub type JobData = Map<String, Value>;

/// A unit of deferred (and possibly recurring) work.
///
/// The job has no existence outside its queue message: it is serialized on
/// enqueue, deserialized on consume and either discarded or re-enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied unique identifier. Never generated by the scheduler.
    pub id: String,
    /// Time of the original submission. Informational only.
    pub enqueue_time: DateTime<Utc>,
    /// Registry key of the executor that runs this job.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Gap between executions in milliseconds. The push backend also uses it
    /// as the native message delay.
    pub interval: u64,
    /// Topic routing key (push backend only).
    #[serde(default)]
    pub routing_key: String,
    /// Destination queue name.
    #[serde(default)]
    pub queue: String,
    /// Friendly region name of the destination queue (poll backend only).
    #[serde(default)]
    pub queue_region: String,
    pub is_recurring: bool,
    /// The poll backend only runs the job once "now" has reached this instant.
    pub exec_time: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub job_data: JobData,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<JobData, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<JobData>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Job {
    /// Create a one-shot job due immediately.
    pub fn new(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            enqueue_time: now,
            job_type: job_type.into(),
            interval: 0,
            routing_key: String::new(),
            queue: String::new(),
            queue_region: String::new(),
            is_recurring: false,
            exec_time: now,
            job_data: JobData::new(),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval = interval_ms;
        self
    }

    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    #[must_use]
    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.queue_region = region.into();
        self
    }

    #[must_use]
    pub fn recurring(mut self, is_recurring: bool) -> Self {
        self.is_recurring = is_recurring;
        self
    }

    #[must_use]
    pub fn at(mut self, exec_time: DateTime<Utc>) -> Self {
        self.exec_time = exec_time;
        self
    }

    #[must_use]
    pub fn with_data(mut self, job_data: JobData) -> Self {
        self.job_data = job_data;
        self
    }

    /// Insert a single payload entry.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.job_data.insert(key.into(), value.into());
        self
    }

    /// The recurrence interval as a duration.
    #[inline]
    pub fn interval(&self) -> Duration {
        i64::try_from(self.interval)
            .ok()
            .and_then(Duration::try_milliseconds)
            .unwrap_or(Duration::MAX)
    }

    /// Whether the execution-time gate is satisfied at `now`, allowing the job
    /// to fire up to `tolerance` early.
    #[inline]
    pub fn is_due(&self, now: DateTime<Utc>, tolerance: Duration) -> bool {
        match self.exec_time.checked_sub_signed(tolerance) {
            Some(earliest) => now >= earliest,
            None => true,
        }
    }

    /// Set the next execution time to `base + interval`.
    pub fn schedule_after(&mut self, base: DateTime<Utc>) {
        self.exec_time = base
            .checked_add_signed(self.interval())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Serialize to the JSON wire format shared by every backend.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_wire(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Look up this job's executor and populate a fresh instance from
    /// [`job_data`](Self::job_data).
    pub fn executor(&self, registry: &ExecutorRegistry) -> Result<Box<dyn Executor>, DispatchError> {
        registry.resolve(self)
    }
}

/// Parameters for `Monitor`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub queue_name: String,
    /// Required by the poll backend only.
    #[serde(default)]
    pub region_name: String,
}

impl MonitorConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            region_name: String::new(),
        }
    }

    #[must_use]
    pub fn in_region(mut self, region_name: impl Into<String>) -> Self {
        self.region_name = region_name.into();
        self
    }
}
