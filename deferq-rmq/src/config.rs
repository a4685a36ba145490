//! Queue bindings and broker connection settings.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

pub const DEFAULT_EXCHANGE: &str = "deferq.delayed";
const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;

/// A queue to declare and bind to the delayed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmqConfig {
    pub queue_name: String,
    pub routing_key: String,
}

impl RmqConfig {
    #[inline]
    pub fn new(queue_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Runtime settings of the push backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RmqSettings {
    /// Broker URL. Only used by connectors that dial by URL.
    pub url: String,
    /// Exchange every job is published to.
    pub exchange: String,
    /// Pause before rebuilding the connection after the consumer stops.
    pub restart_delay_ms: u64,
}

impl Default for RmqSettings {
    #[inline]
    fn default() -> Self {
        Self {
            url: String::new(),
            exchange: DEFAULT_EXCHANGE.to_owned(),
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
        }
    }
}

impl RmqSettings {
    #[inline]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    #[must_use]
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[inline]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Loads settings from environment variables using the supplied prefix.
    ///
    /// Expected variables:
    /// - `{PREFIX}_RABBITMQ_URL` (required)
    /// - `{PREFIX}_RABBITMQ_EXCHANGE` (optional)
    /// - `{PREFIX}_RABBITMQ_RESTART_DELAY_MS` (optional)
    pub fn from_env(prefix: &str) -> Result<Self, BrokerError> {
        let url_var = format!("{prefix}_RABBITMQ_URL");
        let url = env::var(&url_var)
            .map_err(|_| BrokerError::Connection(format!("environment variable {url_var} is missing")))?;
        if url.trim().is_empty() {
            return Err(BrokerError::Connection("broker url cannot be empty".to_owned()));
        }

        let mut settings = Self::new(url);
        if let Ok(exchange) = env::var(format!("{prefix}_RABBITMQ_EXCHANGE")) {
            settings.exchange = exchange;
        }
        let delay_var = format!("{prefix}_RABBITMQ_RESTART_DELAY_MS");
        if let Ok(raw) = env::var(&delay_var) {
            settings.restart_delay_ms = raw.trim().parse().map_err(|e| {
                BrokerError::Connection(format!("failed to parse {delay_var}: {e}"))
            })?;
        }
        Ok(settings)
    }
}
