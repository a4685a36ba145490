//! Delayed-exchange topology.

use std::collections::BTreeMap;

use tracing::{error, info};

use crate::config::RmqConfig;
use crate::error::BrokerError;
use crate::transport::{
    Channel, ExchangeOptions, QueueOptions, DELAYED_EXCHANGE_KIND, DELAYED_TYPE_ARGUMENT,
};

/// Declare a durable delayed-message exchange that routes by topic, then
/// declare and bind every configured queue.
///
/// Declarations are idempotent, so this can run on every start.
pub async fn setup(channel: &dyn Channel, exchange: &str, configs: &[RmqConfig]) -> Result<(), BrokerError> {
    let mut arguments = BTreeMap::new();
    arguments.insert(DELAYED_TYPE_ARGUMENT.to_owned(), "topic".to_owned());
    let options = ExchangeOptions {
        kind: DELAYED_EXCHANGE_KIND.to_owned(),
        durable: true,
        auto_delete: false,
        internal: false,
        arguments,
    };
    if let Err(err) = channel.exchange_declare(exchange, &options).await {
        error!(%exchange, error = %err, "error creating exchange");
        return Err(err);
    }

    for config in configs {
        declare_and_bind(channel, exchange, config).await?;
    }
    info!(%exchange, queues = configs.len(), "delayed exchange topology ready");
    Ok(())
}

async fn declare_and_bind(channel: &dyn Channel, exchange: &str, config: &RmqConfig) -> Result<(), BrokerError> {
    let options = QueueOptions {
        durable: true,
        auto_delete: false,
        exclusive: false,
    };
    if let Err(err) = channel.queue_declare(&config.queue_name, options).await {
        error!(queue = %config.queue_name, error = %err, "error creating queue");
        return Err(err);
    }
    if let Err(err) = channel
        .queue_bind(&config.queue_name, &config.routing_key, exchange)
        .await
    {
        error!(queue = %config.queue_name, routing_key = %config.routing_key, error = %err, "error binding queue");
        return Err(err);
    }
    Ok(())
}
