//! The connection and the two channels the push backend shares across tasks.
//!
//! All three handles live behind one lock and are only ever replaced while
//! holding it. Users clone the handle they need and release the lock before
//! doing I/O; an operation that fails on a handle that has meanwhile been
//! replaced simply retries against the fresh one.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::transport::{same_handle, Channel, Connection, Connector};

struct Handles {
    connection: Arc<dyn Connection>,
    publisher: Arc<dyn Channel>,
    consumer: Arc<dyn Channel>,
}

pub struct BrokerLink {
    connector: Arc<dyn Connector>,
    handles: RwLock<Handles>,
}

impl BrokerLink {
    /// Dial the broker and open the publisher and consumer channels.
    pub async fn open(connector: Arc<dyn Connector>) -> Result<Self, BrokerError> {
        let connection = connector.dial().await?;
        let publisher = connection.channel().await?;
        let consumer = connection.channel().await?;
        info!("broker connection and channels initiated");
        Ok(Self {
            connector,
            handles: RwLock::new(Handles {
                connection,
                publisher,
                consumer,
            }),
        })
    }

    pub async fn connection(&self) -> Arc<dyn Connection> {
        self.handles.read().await.connection.clone()
    }

    pub async fn publisher(&self) -> Arc<dyn Channel> {
        self.handles.read().await.publisher.clone()
    }

    pub async fn consumer(&self) -> Arc<dyn Channel> {
        self.handles.read().await.consumer.clone()
    }

    /// Replace the publisher channel after `stale` failed.
    ///
    /// Closes `stale` and opens a new channel; if the connection cannot open
    /// one, the connection is redialed first. When another task already
    /// replaced `stale`, its replacement is returned untouched.
    pub async fn recover_publisher(&self, stale: &Arc<dyn Channel>) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut handles = self.handles.write().await;
        if !same_handle(&handles.publisher, stale) {
            return Ok(handles.publisher.clone());
        }

        stale.close().await;
        let publisher = match handles.connection.channel().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(error = %err, "cannot open publisher channel, redialing");
                handles.connection.close().await;
                handles.connection = self.connector.dial().await?;
                handles.connection.channel().await?
            }
        };
        handles.publisher = publisher.clone();
        info!("re-initiated publisher channel");
        Ok(publisher)
    }

    pub async fn restart_connection(&self) -> Result<(), BrokerError> {
        let mut handles = self.handles.write().await;
        handles.connection.close().await;
        handles.connection = self.connector.dial().await?;
        info!("re-initiated connection");
        Ok(())
    }

    pub async fn restart_publisher(&self) -> Result<(), BrokerError> {
        let mut handles = self.handles.write().await;
        handles.publisher.close().await;
        handles.publisher = handles.connection.channel().await?;
        info!("re-initiated publisher channel");
        Ok(())
    }

    pub async fn restart_consumer(&self) -> Result<(), BrokerError> {
        let mut handles = self.handles.write().await;
        handles.consumer.close().await;
        handles.consumer = handles.connection.channel().await?;
        info!("re-initiated consumer channel");
        Ok(())
    }
}
