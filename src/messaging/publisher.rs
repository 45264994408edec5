//! Sharded publisher.
//!
//! Each publish goes to the topic's direct exchange with the routing key of
//! the next shard queue in the topic's round-robin cycle. Messages are marked
//! persistent and the channel runs in publisher-confirm mode, so a message the
//! broker refuses is counted as a publish error.
//!
//! The shard is picked when `publish` is first polled, before it waits for the
//! connection, so back-to-back publishes get their shards in call order even
//! when they complete out of order.

use std::sync::{Arc, OnceLock};

use tracing::{debug, error};

use super::channel::ManagedChannel;
use super::metrics::Metrics;
use super::shard_router::ShardRouter;
use super::topology::TopologyProvisioner;
use crate::broker::BrokerConnection;
use crate::error::{MqError, Result};
use crate::types::{MqConfig, PublishErrorPolicy, Topic};

pub struct Publisher {
    connection: Arc<dyn BrokerConnection>,
    /// Created on first publish
    channel: OnceLock<ManagedChannel>,
    router: ShardRouter,
    provisioner: TopologyProvisioner,
    metrics: Metrics,
    error_policy: PublishErrorPolicy,
}

impl Publisher {
    pub fn new(connection: Arc<dyn BrokerConnection>, config: &MqConfig, metrics: Metrics) -> Self {
        Self {
            connection,
            channel: OnceLock::new(),
            router: ShardRouter::new(config.shard_count),
            provisioner: TopologyProvisioner::new(config.shard_count),
            metrics,
            error_policy: config.publish_error_policy,
        }
    }

    /// Publish `body` to the next shard of `topic`.
    ///
    /// Waits for the broker connection if it is down. The shard cycle
    /// advances whether or not the broker accepts the message. Broker
    /// failures are logged and counted; they are returned only under
    /// [`PublishErrorPolicy::Propagate`].
    pub async fn publish(&self, topic: &Topic, body: &[u8]) -> Result<()> {
        let shard = self.router.next_shard(topic.as_str());
        let routing_key = topic.shard_queue(shard);
        let exchange = topic.exchange();

        let channel = self.channel.get_or_init(|| {
            debug!("Creating publish channel");
            ManagedChannel::new("publish", Arc::clone(&self.connection)).with_publisher_confirms()
        });
        let outcome = match channel.acquire_for(topic, &self.provisioner).await {
            Ok(acquired) => {
                acquired
                    .channel
                    .publish(exchange, &routing_key, body, true)
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.metrics.record_published(&routing_key, exchange);
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    shard,
                    bytes = body.len(),
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_publish_error(&routing_key, exchange);
                error!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    shard,
                    error = %e,
                    "Failed to publish message"
                );
                match self.error_policy {
                    PublishErrorPolicy::Swallow => Ok(()),
                    PublishErrorPolicy::Propagate => Err(MqError::Publish {
                        exchange: exchange.to_string(),
                        routing_key,
                        source: e,
                    }),
                }
            }
        }
    }
}
