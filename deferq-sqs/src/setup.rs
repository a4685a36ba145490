//! Queue provisioning utilities.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::SqsError;
use crate::regions::SqsRegions;
use crate::transport::{
    CloudQueue, QueueAttributes, DELAY_SECONDS, RECEIVE_WAIT_TIME, RETENTION_PERIOD,
    VISIBILITY_TIMEOUT,
};

/// No delay.
pub const MIN_QUEUE_DELAY: u32 = 0;
/// Fifteen minutes, the longest a message can be held back.
pub const MAX_QUEUE_DELAY: u32 = 900;

/// A queue to create during [`setup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqsConfig {
    /// Friendly region name, see [`crate::REGION_NAMES`].
    pub region_name: String,
    pub queue_name: String,
    /// Queue-wide delivery delay in seconds, at most [`MAX_QUEUE_DELAY`].
    #[serde(default)]
    pub delay: u32,
}

impl SqsConfig {
    pub fn new(region_name: impl Into<String>, queue_name: impl Into<String>, delay: u32) -> Self {
        Self {
            region_name: region_name.into(),
            queue_name: queue_name.into(),
            delay,
        }
    }
}

fn attributes(pairs: &[(&str, String)]) -> QueueAttributes {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

/// Create every configured queue. Stops at the first failure; creating a
/// queue that already exists succeeds.
pub async fn setup(regions: &SqsRegions, configs: &[SqsConfig]) -> Result<(), SqsError> {
    for config in configs {
        if let Err(err) = create_queue_with_delay(regions, config).await {
            error!(region = %config.region_name, queue = %config.queue_name, error = %err, "error creating queue");
            return Err(err);
        }
    }
    info!(queues = configs.len(), "queues ready");
    Ok(())
}

/// Create a queue with a 30 s visibility timeout, 10 s receive wait and
/// 15 minute retention.
pub async fn create_queue(regions: &SqsRegions, region_name: &str, queue_name: &str) -> Result<Arc<dyn CloudQueue>, SqsError> {
    let service = regions.service(region_name)?;
    let attrs = attributes(&[
        (VISIBILITY_TIMEOUT, "30".to_owned()),
        (RECEIVE_WAIT_TIME, "10".to_owned()),
        (RETENTION_PERIOD, "900".to_owned()),
    ]);
    service.create_queue(queue_name, &attrs).await
}

/// Create a queue with a 30 s visibility timeout, 20 s receive wait and the
/// configured delay.
pub async fn create_queue_with_delay(regions: &SqsRegions, config: &SqsConfig) -> Result<Arc<dyn CloudQueue>, SqsError> {
    if !(MIN_QUEUE_DELAY..=MAX_QUEUE_DELAY).contains(&config.delay) {
        return Err(SqsError::InvalidDelay(config.delay));
    }
    let service = regions.service(&config.region_name)?;
    let attrs = attributes(&[
        (VISIBILITY_TIMEOUT, "30".to_owned()),
        (RECEIVE_WAIT_TIME, "20".to_owned()),
        (DELAY_SECONDS, config.delay.to_string()),
    ]);
    service.create_queue(&config.queue_name, &attrs).await
}

pub async fn delete_queue(regions: &SqsRegions, region_name: &str, queue_name: &str) -> Result<(), SqsError> {
    let queue = regions.service(region_name)?.get_queue(queue_name).await?;
    queue.delete().await?;
    info!(region = %region_name, queue = %queue_name, "deleted queue");
    Ok(())
}

/// Send a raw message with no delay. Returns the message id.
pub async fn send_message(regions: &SqsRegions, region_name: &str, queue_name: &str, body: &str) -> Result<String, SqsError> {
    let queue = regions.service(region_name)?.get_queue(queue_name).await?;
    queue.send_message(body, MIN_QUEUE_DELAY).await
}
