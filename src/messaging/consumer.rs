//! Prefetch-bounded consumer over all shard queues of a topic.
//!
//! One channel serves every shard queue of the topic; the prefetch limit is
//! applied to the channel as a whole. Deliveries from all shards are merged
//! and handed to the handler one at a time. Handler failures are logged and
//! never stop consumption. After a connection loss the channel is reopened,
//! the topology provisioned again and every shard resubscribed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{Acquired, ManagedChannel};
use super::envelope::Envelope;
use super::metrics::Metrics;
use super::topology::TopologyProvisioner;
use crate::broker::{BrokerChannel, BrokerConnection, Delivery, DeliveryStream};
use crate::error::{BrokerError, MqError, Result};
use crate::types::{HandlerErrorPolicy, MqConfig, Topic};

/// Pause before retrying after a channel could not be set up.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Processes one delivery.
///
/// The handler may settle the envelope itself. Returning an error (or
/// panicking) is logged and handled according to the configured
/// [`HandlerErrorPolicy`]. Closures `Fn(Envelope) -> impl Future<Output =
/// anyhow::Result<()>>` implement this trait.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

/// Active subscriptions on one broker channel.
struct Subscription {
    channel: Arc<dyn BrokerChannel>,
    consumer_tags: Vec<String>,
    deliveries: stream::SelectAll<DeliveryStream>,
    /// Envelopes handed out on this channel that may still be unsettled
    outstanding: Vec<Envelope>,
}

impl Subscription {
    /// Write off what the handler never settled once the channel is gone.
    /// The broker requeues those deliveries and hands them out again.
    fn release(&mut self, topic: &Topic) {
        let abandoned = self
            .outstanding
            .drain(..)
            .filter(|envelope| envelope.abandon())
            .count();
        if abandoned > 0 {
            warn!(topic = %topic, abandoned, "Channel lost with unsettled deliveries");
        }
    }
}

pub struct Consumer {
    connection: Arc<dyn BrokerConnection>,
    provisioner: TopologyProvisioner,
    metrics: Metrics,
    shard_count: usize,
    prefetch: u16,
    requeue_on_reject: bool,
    error_policy: HandlerErrorPolicy,
}

impl Consumer {
    pub fn new(connection: Arc<dyn BrokerConnection>, config: &MqConfig, metrics: Metrics) -> Self {
        Self {
            connection,
            provisioner: TopologyProvisioner::new(config.shard_count),
            metrics,
            shard_count: config.shard_count.max(1),
            prefetch: config.prefetch,
            requeue_on_reject: config.requeue_on_reject,
            error_policy: config.handler_error_policy,
        }
    }

    /// Consume every shard queue of `topic` until `cancel` fires or the
    /// connection is closed.
    ///
    /// Returns `Ok(())` in both cases; broker errors along the way are
    /// logged and retried.
    pub async fn listen<H>(&self, topic: &Topic, handler: H, cancel: CancellationToken) -> Result<()>
    where
        H: MessageHandler,
    {
        let channel = ManagedChannel::new("consume", Arc::clone(&self.connection));

        loop {
            let acquired = tokio::select! {
                _ = cancel.cancelled() => break,
                acquired = channel.acquire_for(topic, &self.provisioner) => acquired,
            };

            let acquired = match acquired {
                Ok(acquired) => acquired,
                Err(BrokerError::NotConnected) => {
                    info!(topic = %topic, "Connection closed, consumer stopping");
                    break;
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "Failed to open consumer channel");
                    if self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(mut subscription) = self.subscribe(topic, acquired).await else {
                warn!(topic = %topic, "No shard queue could be subscribed, retrying");
                channel.invalidate().await;
                if self.pause(&cancel).await {
                    break;
                }
                continue;
            };

            if self.drain(topic, &handler, &mut subscription, &cancel).await {
                self.unsubscribe(topic, subscription).await;
                break;
            }
            if !subscription.channel.is_open() {
                subscription.release(topic);
            }
            warn!(topic = %topic, "Subscriptions ended, waiting for the broker connection");
        }

        info!(topic = %topic, "Consumer stopped");
        Ok(())
    }

    /// Apply the prefetch limit and subscribe to every provisioned shard queue.
    ///
    /// Shards that fail are logged and skipped. `None` if none succeeded.
    async fn subscribe(&self, topic: &Topic, acquired: Acquired) -> Option<Subscription> {
        let Acquired { channel, topology } = acquired;
        if let Err(e) = channel.set_prefetch(self.prefetch, true).await {
            error!(topic = %topic, prefetch = self.prefetch, error = %e, "Failed to set prefetch");
        }

        let mut consumer_tags = Vec::with_capacity(self.shard_count);
        let mut streams = Vec::with_capacity(self.shard_count);
        for &index in &topology.ready_shards {
            let queue = topic.shard_queue(index);
            let tag = format!("{}-{}", queue, Uuid::new_v4());
            match channel.consume(&queue, &tag).await {
                Ok(deliveries) => {
                    debug!(queue = %queue, consumer_tag = %tag, "Subscribed to shard queue");
                    consumer_tags.push(tag);
                    streams.push(deliveries);
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to subscribe to shard queue");
                }
            }
        }

        if streams.is_empty() {
            return None;
        }
        info!(
            topic = %topic,
            shards = streams.len(),
            prefetch = self.prefetch,
            "Consuming"
        );
        Some(Subscription {
            channel,
            consumer_tags,
            deliveries: stream::select_all(streams),
            outstanding: Vec::new(),
        })
    }

    /// Handle deliveries until cancelled (`true`) or every stream ended (`false`).
    async fn drain<H>(
        &self,
        topic: &Topic,
        handler: &H,
        subscription: &mut Subscription,
        cancel: &CancellationToken,
    ) -> bool
    where
        H: MessageHandler,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return true,
                next = subscription.deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        self.dispatch(topic, handler, subscription, delivery).await;
                    }
                    Some(Err(e)) => {
                        error!(topic = %topic, error = %e, "Delivery stream error");
                    }
                    None => return false,
                },
            }
        }
    }

    /// Run the handler for one delivery and apply the error policy.
    async fn dispatch<H>(
        &self,
        topic: &Topic,
        handler: &H,
        subscription: &mut Subscription,
        delivery: Delivery,
    ) where
        H: MessageHandler,
    {
        self.metrics.record_delivery(&delivery.queue, topic.exchange());
        let envelope = Envelope::new(
            delivery,
            topic.exchange(),
            Arc::clone(&subscription.channel),
            self.metrics.clone(),
            self.requeue_on_reject,
        );
        subscription.outstanding.retain(|held| !held.is_settled());
        subscription.outstanding.push(envelope.clone());

        let outcome = AssertUnwindSafe(handler.handle(envelope.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("message handler panicked")));

        let Err(e) = outcome else {
            return;
        };
        error!(
            queue = %envelope.queue(),
            delivery_tag = envelope.delivery_tag(),
            error = %format!("{:#}", e),
            "Message handler failed"
        );

        if self.error_policy != HandlerErrorPolicy::Reject {
            return;
        }
        match envelope.reject().await {
            Ok(()) => {}
            Err(MqError::AlreadySettled { delivery_tag }) => {
                debug!(
                    queue = %envelope.queue(),
                    delivery_tag,
                    "Handler settled the delivery before failing"
                );
            }
            // Logged inside reject().
            Err(e) => {
                debug!(
                    queue = %envelope.queue(),
                    delivery_tag = envelope.delivery_tag(),
                    error = %e,
                    "Delivery not rejected after handler failure"
                );
            }
        }
    }

    async fn unsubscribe(&self, topic: &Topic, subscription: Subscription) {
        for tag in &subscription.consumer_tags {
            if let Err(e) = subscription.channel.cancel(tag).await {
                warn!(
                    topic = %topic,
                    consumer_tag = %tag,
                    error = %e,
                    "Failed to cancel subscription"
                );
            }
        }
    }

    /// Sleep before a retry. `true` if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::messaging::publisher::Publisher;
    use prometheus::Registry;
    use tokio::sync::mpsc;

    struct Fixture {
        broker: MemoryBroker,
        publisher: Publisher,
        consumer: Arc<Consumer>,
        metrics: Metrics,
        topic: Topic,
    }

    fn fixture(config: MqConfig) -> Fixture {
        let broker = MemoryBroker::new();
        broker.open();
        let metrics = Metrics::register(&Registry::new()).unwrap();
        let connection: Arc<dyn BrokerConnection> = Arc::new(broker.clone());
        Fixture {
            publisher: Publisher::new(Arc::clone(&connection), &config, metrics.clone()),
            consumer: Arc::new(Consumer::new(connection, &config, metrics.clone())),
            broker,
            metrics,
            topic: Topic::new("orders").unwrap(),
        }
    }

    async fn settle_down() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_handler_sees_counters_before_it_runs() {
        let f = fixture(MqConfig::new("localhost"));
        f.publisher.publish(&f.topic, b"A").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let metrics = f.metrics.clone();
        let handler = move |envelope: Envelope| {
            let tx = tx.clone();
            let seen = (
                metrics.consumed("orders-0", "orders"),
                metrics.unacked("orders-0", "orders"),
            );
            async move {
                envelope.acknowledge().await?;
                let _ = tx.send(seen);
                Ok::<_, anyhow::Error>(())
            }
        };

        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        assert_eq!(rx.recv().await, Some((1, 1)));
        assert_eq!(f.metrics.unacked("orders-0", "orders"), 0);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(f.broker.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_outstanding_deliveries() {
        let f = fixture(MqConfig::new("localhost").with_prefetch(2));
        for body in [b"1", b"2", b"3", b"4", b"5"] {
            f.publisher.publish(&f.topic, body).await.unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope);
                Ok::<_, anyhow::Error>(())
            }
        };
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        let first = rx.recv().await.unwrap();
        let _second = rx.recv().await.unwrap();
        settle_down().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(f.broker.unacked_count(), 2);
        assert_eq!(f.broker.prefetch_limits(), vec![2]);

        first.acknowledge().await.unwrap();
        let _third = rx.recv().await.unwrap();
        settle_down().await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_rejects_delivery() {
        let f = fixture(MqConfig::new("localhost").with_requeue_on_reject(false));
        f.publisher.publish(&f.topic, b"A").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope.delivery_tag());
                Err::<(), _>(anyhow::anyhow!("cannot process"))
            }
        };
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        rx.recv().await.unwrap();
        settle_down().await;

        assert_eq!(f.broker.unacked_count(), 0);
        assert_eq!(f.broker.queue_depth("orders-0"), 0);
        assert_eq!(f.metrics.consumed("orders-0", "orders"), 1);
        assert_eq!(f.metrics.unacked("orders-0", "orders"), 0);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_leave_policy_keeps_delivery_unsettled() {
        let config = MqConfig::new("localhost").with_handler_error_policy(HandlerErrorPolicy::Leave);
        let f = fixture(config);
        f.publisher.publish(&f.topic, b"A").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |_envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Err::<(), _>(anyhow::anyhow!("cannot process"))
            }
        };
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        rx.recv().await.unwrap();
        settle_down().await;

        assert_eq!(f.broker.unacked_count(), 1);
        assert_eq!(f.metrics.unacked("orders-0", "orders"), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_settled_by_handler_before_failing_is_not_rejected() {
        let f = fixture(MqConfig::new("localhost"));
        f.publisher.publish(&f.topic, b"A").await.unwrap();
        f.publisher.publish(&f.topic, b"B").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                envelope.acknowledge().await?;
                let _ = tx.send(envelope.body().to_vec());
                Err::<(), _>(anyhow::anyhow!("failed after acknowledging"))
            }
        };
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        let mut bodies = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        bodies.sort();
        assert_eq!(bodies, vec![b"A".to_vec(), b"B".to_vec()]);
        settle_down().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(f.broker.unacked_count(), 0);
        assert_eq!(f.broker.queue_depth("orders-0"), 0);
        assert_eq!(f.metrics.unacked("orders-0", "orders"), 0);
        assert_eq!(f.metrics.consumed("orders-0", "orders"), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unsettled_deliveries_released_when_channel_lost() {
        let config = MqConfig::new("localhost").with_handler_error_policy(HandlerErrorPolicy::Leave);
        let f = fixture(config);
        f.publisher.publish(&f.topic, b"A").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope.redelivered());
                Err::<(), _>(anyhow::anyhow!("cannot process"))
            }
        };
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        assert_eq!(rx.recv().await, Some(false));
        settle_down().await;
        assert_eq!(f.metrics.unacked("orders-0", "orders"), 1);

        f.broker.drop_connection();
        settle_down().await;
        assert_eq!(f.metrics.unacked("orders-0", "orders"), 0);

        f.broker.restore_connection();
        assert_eq!(rx.recv().await, Some(true));
        settle_down().await;

        assert_eq!(f.broker.unacked_count(), 1);
        assert_eq!(
            f.metrics.unacked("orders-0", "orders"),
            f.broker.unacked_count() as i64
        );
        assert_eq!(f.metrics.consumed("orders-0", "orders"), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_skips_shard_that_could_not_be_provisioned() {
        let f = fixture(MqConfig::new("localhost"));
        f.broker.fail_queue_declare("orders-1");
        let handler = |_envelope: Envelope| async { Ok::<_, anyhow::Error>(()) };
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        settle_down().await;
        assert_eq!(f.broker.consumer_count(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_listen_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let f = fixture(MqConfig::new("localhost"));
        let handler = |_envelope: Envelope| async { Ok::<_, anyhow::Error>(()) };

        let listen = f.consumer.listen(&f.topic, handler, CancellationToken::new());

        assert_send(&listen);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_consumer() {
        let f = fixture(MqConfig::new("localhost").with_requeue_on_reject(false));
        f.publisher.publish(&f.topic, b"boom").await.unwrap();
        f.publisher.publish(&f.topic, b"fine").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                if envelope.body() == b"boom" {
                    panic!("handler bug");
                }
                envelope.acknowledge().await?;
                let _ = tx.send(envelope.body().to_vec());
                Ok::<_, anyhow::Error>(())
            }
        };
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        assert_eq!(rx.recv().await, Some(b"fine".to_vec()));
        settle_down().await;
        assert_eq!(f.broker.unacked_count(), 0);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnect() {
        let f = fixture(MqConfig::new("localhost"));
        f.publisher.publish(&f.topic, b"before").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                envelope.acknowledge().await?;
                let _ = tx.send(envelope.body().to_vec());
                Ok::<_, anyhow::Error>(())
            }
        };
        let cancel = CancellationToken::new();
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.listen(&topic, handler, cancel).await }
        });

        assert_eq!(rx.recv().await, Some(b"before".to_vec()));
        assert_eq!(f.broker.consumer_count(), 2);

        f.broker.drop_connection();
        settle_down().await;
        assert_eq!(f.broker.consumer_count(), 0);

        f.broker.restore_connection();
        settle_down().await;
        assert_eq!(f.broker.consumer_count(), 2);

        f.publisher.publish(&f.topic, b"after").await.unwrap();
        assert_eq!(rx.recv().await, Some(b"after".to_vec()));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_connection_closes() {
        let f = fixture(MqConfig::new("localhost"));
        let handler = |_envelope: Envelope| async { Ok::<_, anyhow::Error>(()) };
        let consumer = Arc::clone(&f.consumer);
        let topic = f.topic.clone();
        let task = tokio::spawn(async move {
            consumer.listen(&topic, handler, CancellationToken::new()).await
        });

        settle_down().await;
        assert_eq!(f.broker.consumer_count(), 2);

        f.broker.close().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
