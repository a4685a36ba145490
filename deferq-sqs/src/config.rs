//! Tuning for the receive and processing loops.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_RECEIVE_ERROR_BACKOFF_MS: u64 = 500;

/// What to do with a job received before its execution time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMiss {
    /// Send it back to the queue it came from, delayed by the time left.
    #[default]
    Requeue,
    /// Log and discard it.
    Drop,
}

/// Runtime settings of the poll backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqsSettings {
    /// How early a job may run relative to its execution time.
    pub gate_tolerance_ms: u64,
    /// Capacity of the buffer between the receive and processing loops.
    pub buffer_capacity: usize,
    pub gate_miss: GateMiss,
    /// Pause after a failed receive before polling again.
    pub receive_error_backoff_ms: u64,
}

impl Default for SqsSettings {
    fn default() -> Self {
        Self {
            gate_tolerance_ms: 0,
            buffer_capacity: default_buffer_capacity(),
            gate_miss: GateMiss::default(),
            receive_error_backoff_ms: DEFAULT_RECEIVE_ERROR_BACKOFF_MS,
        }
    }
}

/// Twice the number of processing slots available to this process.
pub fn default_buffer_capacity() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get()) * 2
}

impl SqsSettings {
    #[must_use]
    pub fn with_gate_tolerance(mut self, tolerance: Duration) -> Self {
        self.gate_tolerance_ms = u64::try_from(tolerance.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_gate_miss(mut self, gate_miss: GateMiss) -> Self {
        self.gate_miss = gate_miss;
        self
    }

    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_receive_error_backoff(mut self, backoff: Duration) -> Self {
        self.receive_error_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn gate_tolerance(&self) -> chrono::Duration {
        i64::try_from(self.gate_tolerance_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn receive_error_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_error_backoff_ms)
    }
}
