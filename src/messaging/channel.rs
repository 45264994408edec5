//! Channel that follows the connection across reconnects.
//!
//! A [`ManagedChannel`] is created lazily and remembers the connection epoch
//! its broker channel belongs to. After a reconnect (or if the broker closed
//! the channel) the next use opens a fresh channel and provisions the topics
//! it serves again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::topology::{ProvisionReport, TopologyProvisioner};
use crate::broker::{BrokerChannel, BrokerConnection, ConnectionState};
use crate::error::BrokerError;
use crate::types::Topic;

struct Attached {
    epoch: u64,
    channel: Arc<dyn BrokerChannel>,
    /// Topics provisioned for this broker channel
    provisioned: HashMap<String, Arc<ProvisionReport>>,
}

/// A live broker channel plus the topology state of the topic it was acquired for.
pub struct Acquired {
    pub channel: Arc<dyn BrokerChannel>,
    pub topology: Arc<ProvisionReport>,
}

pub struct ManagedChannel {
    /// Used in log lines only
    purpose: &'static str,
    connection: Arc<dyn BrokerConnection>,
    /// Open every broker channel in publisher-confirm mode
    confirms: bool,
    current: Mutex<Option<Attached>>,
}

impl ManagedChannel {
    pub fn new(purpose: &'static str, connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            purpose,
            connection,
            confirms: false,
            current: Mutex::new(None),
        }
    }

    /// Put every broker channel opened from now on in confirm mode.
    pub fn with_publisher_confirms(mut self) -> Self {
        self.confirms = true;
        self
    }

    /// Wait until the connection is up and return its epoch.
    ///
    /// Waits indefinitely while the connection manager retries; fails only
    /// once the connection has been closed.
    pub async fn wait_for_connect(&self) -> Result<u64, BrokerError> {
        let mut state = self.connection.state();
        let reached = *state
            .wait_for(|s| s.is_connected() || *s == ConnectionState::Closed)
            .await
            .map_err(|_| BrokerError::NotConnected)?;
        reached.epoch().ok_or(BrokerError::NotConnected)
    }

    /// A live broker channel for which `topic` has been provisioned.
    pub async fn acquire_for(
        &self,
        topic: &Topic,
        provisioner: &TopologyProvisioner,
    ) -> Result<Acquired, BrokerError> {
        loop {
            let epoch = self.wait_for_connect().await?;
            let mut current = self.current.lock().await;

            let attached = match current.take() {
                Some(attached) if attached.epoch == epoch && attached.channel.is_open() => attached,
                _ => match self.open(epoch).await {
                    Ok(attached) => attached,
                    // Lost between the state check and the open; wait for the next epoch.
                    Err(BrokerError::NotConnected) => {
                        drop(current);
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let attached = current.insert(attached);
            let topology = match attached.provisioned.get(topic.as_str()) {
                Some(report) => Arc::clone(report),
                None => {
                    let report = provisioner.provision(self.connection.as_ref(), topic).await;
                    let report = Arc::new(report);
                    attached
                        .provisioned
                        .insert(topic.to_string(), Arc::clone(&report));
                    report
                }
            };
            return Ok(Acquired {
                channel: Arc::clone(&attached.channel),
                topology,
            });
        }
    }

    /// Forget the current broker channel; the next acquire opens a new one
    /// and provisions again.
    pub async fn invalidate(&self) {
        if let Some(attached) = self.current.lock().await.take() {
            debug!(purpose = self.purpose, epoch = attached.epoch, "Dropping channel");
            if let Err(e) = attached.channel.close().await {
                debug!(purpose = self.purpose, error = %e, "Failed to close channel");
            }
        }
    }

    async fn open(&self, epoch: u64) -> Result<Attached, BrokerError> {
        let channel = self.connection.create_channel().await?;
        if self.confirms {
            channel.enable_confirms().await?;
        }
        debug!(purpose = self.purpose, epoch, confirms = self.confirms, "Opened channel");
        Ok(Attached {
            epoch,
            channel,
            provisioned: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn test_reuses_channel_within_epoch() {
        let broker = MemoryBroker::new();
        broker.open();
        let managed = ManagedChannel::new("test", Arc::new(broker.clone()));
        let provisioner = TopologyProvisioner::new(2);
        let topic = Topic::new("orders").unwrap();

        managed.acquire_for(&topic, &provisioner).await.unwrap();
        let second = managed.acquire_for(&topic, &provisioner).await.unwrap();

        assert_eq!(broker.channel_count(), 1);
        assert!(broker.has_exchange("orders"));
        assert!(second.topology.is_complete());
    }

    #[tokio::test]
    async fn test_reprovisions_after_reconnect() {
        let broker = MemoryBroker::new();
        broker.open();
        let managed = ManagedChannel::new("test", Arc::new(broker.clone()));
        let provisioner = TopologyProvisioner::new(2);
        let topic = Topic::new("orders").unwrap();

        let first = managed.acquire_for(&topic, &provisioner).await.unwrap();
        broker.drop_connection();
        assert!(!first.channel.is_open());
        broker.restore_connection();

        let second = managed.acquire_for(&topic, &provisioner).await.unwrap();
        assert!(second.channel.is_open());
        assert_eq!(broker.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_fails() {
        let broker = MemoryBroker::new();
        broker.open();
        broker.close().await.unwrap();
        let managed = ManagedChannel::new("test", Arc::new(broker));

        assert_eq!(managed.wait_for_connect().await, Err(BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn test_confirm_mode_reports_nacks() {
        let broker = MemoryBroker::new();
        broker.open();
        let managed =
            ManagedChannel::new("test", Arc::new(broker.clone())).with_publisher_confirms();
        let topic = Topic::new("orders").unwrap();
        let acquired = managed
            .acquire_for(&topic, &TopologyProvisioner::new(1))
            .await
            .unwrap();
        broker.nack_next_publishes(1);

        let result = acquired.channel.publish("orders", "orders-0", b"x", true).await;

        assert!(matches!(result, Err(BrokerError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_invalidate_opens_and_provisions_again() {
        let broker = MemoryBroker::new();
        broker.open();
        broker.fail_queue_declare("orders-1");
        let managed = ManagedChannel::new("test", Arc::new(broker.clone()));
        let provisioner = TopologyProvisioner::new(2);
        let topic = Topic::new("orders").unwrap();

        let first = managed.acquire_for(&topic, &provisioner).await.unwrap();
        assert_eq!(first.topology.ready_shards, vec![0]);

        managed.invalidate().await;
        assert!(!first.channel.is_open());
        let second = managed.acquire_for(&topic, &provisioner).await.unwrap();

        assert!(second.channel.is_open());
        assert_eq!(second.topology.ready_shards, vec![0]);
        assert_eq!(broker.channel_count(), 1);
    }
}
