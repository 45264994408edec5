//! A delivery handed to a message handler, with its settlement operations.

use std::fmt;
use std::str::Utf8Error;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::metrics::Metrics;
use crate::broker::{BrokerChannel, Delivery};
use crate::error::{BrokerError, MqError, Result};

const PENDING: u8 = 0;
const SETTLED: u8 = 1;
/// The channel it arrived on is gone; the broker will redeliver it.
const ABANDONED: u8 = 2;

/// A received message.
///
/// Cloning is cheap and clones share settlement state: a delivery is
/// acknowledged or rejected at most once, whichever clone does it. The
/// `mq_messages_unacked` gauge is decremented on that single settlement, or
/// when the consumer writes the delivery off after losing its channel.
#[derive(Clone)]
pub struct Envelope {
    inner: Arc<Inner>,
}

struct Inner {
    delivery: Delivery,
    /// Exchange label used for metrics
    exchange: String,
    channel: Arc<dyn BrokerChannel>,
    metrics: Metrics,
    requeue_on_reject: bool,
    settlement: AtomicU8,
}

impl Envelope {
    pub(crate) fn new(
        delivery: Delivery,
        exchange: &str,
        channel: Arc<dyn BrokerChannel>,
        metrics: Metrics,
        requeue_on_reject: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                delivery,
                exchange: exchange.to_string(),
                channel,
                metrics,
                requeue_on_reject,
                settlement: AtomicU8::new(PENDING),
            }),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.delivery.body
    }

    /// The body as UTF-8 text.
    pub fn body_str(&self) -> std::result::Result<&str, Utf8Error> {
        std::str::from_utf8(&self.inner.delivery.body)
    }

    /// Shard queue the message was read from.
    pub fn queue(&self) -> &str {
        &self.inner.delivery.queue
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.inner.delivery.routing_key
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery.delivery_tag
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.inner.delivery.redelivered
    }

    /// Whether the delivery was acknowledged, rejected or written off.
    pub fn is_settled(&self) -> bool {
        self.inner.settlement.load(Ordering::SeqCst) != PENDING
    }

    /// Confirm successful processing.
    pub async fn acknowledge(&self) -> Result<()> {
        self.settle()?;
        self.inner
            .channel
            .ack(self.delivery_tag())
            .await
            .map_err(|e| {
                warn!(
                    queue = %self.queue(),
                    delivery_tag = self.delivery_tag(),
                    error = %e,
                    "Failed to acknowledge delivery"
                );
                MqError::Broker(e)
            })
    }

    /// Signal failed processing. The message is requeued when the consumer
    /// is configured with `requeue_on_reject`, dropped otherwise.
    pub async fn reject(&self) -> Result<()> {
        self.settle()?;
        self.inner
            .channel
            .reject(self.delivery_tag(), self.inner.requeue_on_reject)
            .await
            .map_err(|e| {
                warn!(
                    queue = %self.queue(),
                    delivery_tag = self.delivery_tag(),
                    error = %e,
                    "Failed to reject delivery"
                );
                MqError::Broker(e)
            })
    }

    /// Write off a delivery whose channel was lost. `true` if it was still
    /// pending; later `acknowledge`/`reject` calls fail with a closed channel.
    pub(crate) fn abandon(&self) -> bool {
        let claimed = self.claim(ABANDONED).is_ok();
        if claimed {
            self.inner
                .metrics
                .record_settled(self.queue(), &self.inner.exchange);
        }
        claimed
    }

    /// Claim the single settlement and update the gauge.
    fn settle(&self) -> Result<()> {
        match self.claim(SETTLED) {
            Ok(()) => {
                self.inner
                    .metrics
                    .record_settled(self.queue(), &self.inner.exchange);
                Ok(())
            }
            Err(ABANDONED) => Err(MqError::Broker(BrokerError::ChannelClosed(format!(
                "delivery {} belongs to a lost channel",
                self.delivery_tag()
            )))),
            Err(_) => Err(MqError::AlreadySettled {
                delivery_tag: self.delivery_tag(),
            }),
        }
    }

    fn claim(&self, outcome: u8) -> std::result::Result<(), u8> {
        self.inner
            .settlement
            .compare_exchange(PENDING, outcome, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("queue", &self.queue())
            .field("routing_key", &self.routing_key())
            .field("delivery_tag", &self.delivery_tag())
            .field("redelivered", &self.redelivered())
            .field("bytes", &self.body().len())
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnection, ExchangeKind, MemoryBroker};
    use futures::StreamExt;
    use prometheus::Registry;

    async fn received(broker: &MemoryBroker, requeue: bool) -> (Envelope, Metrics) {
        broker.open();
        let channel = broker.create_channel().await.unwrap();
        channel.declare_exchange("orders", ExchangeKind::Direct).await.unwrap();
        channel.declare_queue("orders-0").await.unwrap();
        channel.bind_queue("orders-0", "orders", "orders-0").await.unwrap();
        channel.publish("orders", "orders-0", b"hello", true).await.unwrap();

        let mut stream = channel.consume("orders-0", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        let metrics = Metrics::register(&Registry::new()).unwrap();
        metrics.record_delivery("orders-0", "orders");
        let envelope = Envelope::new(delivery, "orders", channel, metrics.clone(), requeue);
        (envelope, metrics)
    }

    #[tokio::test]
    async fn test_accessors() {
        let broker = MemoryBroker::new();
        let (envelope, _metrics) = received(&broker, true).await;

        assert_eq!(envelope.body_str().unwrap(), "hello");
        assert_eq!(envelope.queue(), "orders-0");
        assert_eq!(envelope.exchange(), "orders");
        assert_eq!(envelope.routing_key(), "orders-0");
        assert!(!envelope.redelivered());
        assert!(!envelope.is_settled());
    }

    #[tokio::test]
    async fn test_acknowledge_settles_once() {
        let broker = MemoryBroker::new();
        let (envelope, metrics) = received(&broker, true).await;

        envelope.acknowledge().await.unwrap();
        assert!(envelope.is_settled());
        assert_eq!(metrics.unacked("orders-0", "orders"), 0);
        assert_eq!(broker.unacked_count(), 0);

        let again = envelope.clone().reject().await;
        assert!(matches!(again, Err(MqError::AlreadySettled { .. })));
        assert_eq!(metrics.unacked("orders-0", "orders"), 0);
    }

    #[tokio::test]
    async fn test_reject_requeues_when_configured() {
        let broker = MemoryBroker::new();
        let (envelope, metrics) = received(&broker, true).await;

        envelope.reject().await.unwrap();

        assert_eq!(metrics.unacked("orders-0", "orders"), 0);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("orders-0"), 1);
    }

    #[tokio::test]
    async fn test_abandon_clears_gauge_once() {
        let broker = MemoryBroker::new();
        let (envelope, metrics) = received(&broker, true).await;

        assert!(envelope.abandon());
        assert!(!envelope.clone().abandon());
        assert!(envelope.is_settled());
        assert_eq!(metrics.unacked("orders-0", "orders"), 0);

        let result = envelope.acknowledge().await;
        assert!(matches!(result, Err(MqError::Broker(BrokerError::ChannelClosed(_)))));
        assert_eq!(metrics.unacked("orders-0", "orders"), 0);
    }

    #[tokio::test]
    async fn test_reject_drops_without_requeue() {
        let broker = MemoryBroker::new();
        let (envelope, _metrics) = received(&broker, false).await;

        envelope.reject().await.unwrap();

        assert_eq!(broker.queue_depth("orders-0"), 0);
    }
}
