//! Exchange and shard-queue provisioning.
//!
//! Every declaration is attempted independently: a failure on one shard is
//! logged and recorded in the [`ProvisionReport`], and the remaining shards
//! are still provisioned. The affected shard stays unusable until fixed on
//! the broker side.
//!
//! A failed declaration closes the AMQP channel it was issued on, so
//! declarations run on their own [`DeclarationChannel`], which opens a fresh
//! broker channel whenever the previous one was closed by an error.

use std::sync::Arc;

use tracing::{debug, error};

use crate::broker::{BrokerChannel, BrokerConnection, ExchangeKind};
use crate::error::BrokerError;
use crate::types::Topic;

/// Outcome of provisioning one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub exchange_ready: bool,
    /// Shards whose queue was declared and bound
    pub ready_shards: Vec<usize>,
    /// Shards that failed, with the first error for each
    pub failed_shards: Vec<(usize, BrokerError)>,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.exchange_ready && self.failed_shards.is_empty()
    }
}

/// Broker channel used only for declarations, reopened after each failure.
pub struct DeclarationChannel<'a> {
    connection: &'a dyn BrokerConnection,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl<'a> DeclarationChannel<'a> {
    pub fn new(connection: &'a dyn BrokerConnection) -> Self {
        Self {
            connection,
            channel: None,
        }
    }

    /// The open channel, opening a new one if needed.
    async fn get(&mut self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if let Some(channel) = &self.channel {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            debug!("Declaration channel closed by the broker, reopening");
        }
        let channel = self.connection.create_channel().await?;
        self.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Release the broker channel.
    pub async fn close(mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close declaration channel");
        }
    }
}

/// Declares the direct exchange and shard queues for topics.
#[derive(Debug, Clone)]
pub struct TopologyProvisioner {
    shard_count: usize,
}

impl TopologyProvisioner {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    /// Assert the direct exchange `name`. Errors are logged, not returned.
    pub async fn ensure_exchange(
        &self,
        declarations: &mut DeclarationChannel<'_>,
        name: &str,
    ) -> bool {
        let result = match declarations.get().await {
            Ok(channel) => channel.declare_exchange(name, ExchangeKind::Direct).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!(exchange = %name, "Exchange asserted");
                true
            }
            Err(e) => {
                error!(exchange = %name, error = %e, "Failed to assert exchange");
                false
            }
        }
    }

    /// Assert `topic-0 .. topic-(N-1)` and bind each to the topic exchange
    /// with its own name as routing key.
    pub async fn ensure_consumer_queues(
        &self,
        declarations: &mut DeclarationChannel<'_>,
        topic: &Topic,
    ) -> (Vec<usize>, Vec<(usize, BrokerError)>) {
        let mut ready = Vec::with_capacity(self.shard_count);
        let mut failed = Vec::new();

        for index in 0..self.shard_count {
            let queue = topic.shard_queue(index);
            match self.ensure_shard(declarations, topic, &queue).await {
                Ok(()) => ready.push(index),
                Err(e) => {
                    error!(
                        topic = %topic,
                        queue = %queue,
                        error = %e,
                        "Failed to provision shard queue"
                    );
                    failed.push((index, e));
                }
            }
        }

        (ready, failed)
    }

    async fn ensure_shard(
        &self,
        declarations: &mut DeclarationChannel<'_>,
        topic: &Topic,
        queue: &str,
    ) -> Result<(), BrokerError> {
        let channel = declarations.get().await?;
        channel.declare_queue(queue).await?;
        channel.bind_queue(queue, topic.exchange(), queue).await
    }

    /// Exchange plus all shard queues for `topic`.
    pub async fn provision(&self, connection: &dyn BrokerConnection, topic: &Topic) -> ProvisionReport {
        let mut declarations = DeclarationChannel::new(connection);
        let exchange_ready = self.ensure_exchange(&mut declarations, topic.exchange()).await;
        let (ready_shards, failed_shards) =
            self.ensure_consumer_queues(&mut declarations, topic).await;
        declarations.close().await;

        let report = ProvisionReport {
            exchange_ready,
            ready_shards,
            failed_shards,
        };
        if report.is_complete() {
            debug!(topic = %topic, shards = self.shard_count, "Topology provisioned");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use pretty_assertions::assert_eq;

    fn connected() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.open();
        broker
    }

    #[tokio::test]
    async fn test_provisions_exchange_and_bound_shards() {
        let broker = connected();
        let topic = Topic::new("orders").unwrap();

        let report = TopologyProvisioner::new(2).provision(&broker, &topic).await;

        assert!(report.is_complete());
        assert!(broker.has_exchange("orders"));
        assert_eq!(broker.queue_names(), vec!["orders-0", "orders-1"]);
        assert_eq!(
            broker.bindings_for("orders-1"),
            vec![("orders".to_string(), "orders-1".to_string())]
        );
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_provisioning_is_idempotent() {
        let broker = connected();
        let topic = Topic::new("orders").unwrap();
        let provisioner = TopologyProvisioner::new(2);

        let first = provisioner.provision(&broker, &topic).await;
        let second = provisioner.provision(&broker, &topic).await;

        assert_eq!(first, second);
        assert!(second.is_complete());
        assert_eq!(broker.exchange_count(), 1);
        assert_eq!(broker.queue_names().len(), 2);
        assert_eq!(broker.bindings_for("orders-0").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_shard_does_not_stop_the_rest() {
        let broker = connected();
        broker.fail_queue_declare("orders-1");
        let topic = Topic::new("orders").unwrap();

        let report = TopologyProvisioner::new(3).provision(&broker, &topic).await;

        assert!(report.exchange_ready);
        assert_eq!(report.ready_shards, vec![0, 2]);
        assert_eq!(report.failed_shards.len(), 1);
        assert_eq!(report.failed_shards[0].0, 1);
        assert_eq!(broker.queue_names(), vec!["orders-0", "orders-2"]);
        assert_eq!(broker.bindings_for("orders-2").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_bind_reopens_channel_for_later_shards() {
        let broker = connected();
        broker.fail_bind("orders-0");
        let topic = Topic::new("orders").unwrap();

        let report = TopologyProvisioner::new(3).provision(&broker, &topic).await;

        assert_eq!(report.ready_shards, vec![1, 2]);
        assert!(matches!(
            report.failed_shards.as_slice(),
            [(0, BrokerError::PreconditionFailed(_))]
        ));
        assert!(broker.bindings_for("orders-0").is_empty());
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_exchange_mismatch_is_logged_not_fatal() {
        let broker = connected();
        let channel = broker.create_channel().await.unwrap();
        channel.declare_exchange("orders", ExchangeKind::Fanout).await.unwrap();
        let topic = Topic::new("orders").unwrap();

        let report = TopologyProvisioner::new(2).provision(&broker, &topic).await;

        assert!(!report.exchange_ready);
        assert_eq!(report.ready_shards, vec![0, 1]);
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_every_shard() {
        let broker = MemoryBroker::unreachable();
        let topic = Topic::new("orders").unwrap();

        let report = TopologyProvisioner::new(2).provision(&broker, &topic).await;

        assert!(!report.exchange_ready);
        assert!(report.ready_shards.is_empty());
        assert!(report
            .failed_shards
            .iter()
            .all(|(_, e)| *e == BrokerError::NotConnected));
    }
}
