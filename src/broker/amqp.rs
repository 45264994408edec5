//! AMQP 0-9-1 broker connection backed by lapin.
//!
//! lapin has no automatic recovery, so [`AmqpConnection`] runs a small
//! supervisor task: connect, wait for the connection to fail, back off,
//! connect again. Every transition is published on a watch channel; the
//! messaging layer turns those into health signals and channel re-setup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    BrokerChannel, BrokerConnection, BrokerResult, ConnectionState, Delivery, DeliveryStream,
    ExchangeKind, ReconnectBackoff,
};
use crate::error::BrokerError;
use crate::types::MqConfig;

/// Delivery mode flag asking the broker to write the message to disk.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reply code sent with a normal connection or channel close.
const REPLY_SUCCESS: u16 = 200;

/// Broker connection with automatic reconnect.
pub struct AmqpConnection {
    inner: Arc<Inner>,
}

struct Inner {
    uri: AMQPUri,
    /// host:port/vhost, safe to log
    endpoint: String,
    min_delay: Duration,
    max_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
    current: RwLock<Option<Connection>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl AmqpConnection {
    /// Create a connection for `config`. Nothing happens on the network until
    /// [`BrokerConnection::open`] is called.
    pub fn new(config: &MqConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(Inner {
                uri: config.amqp_uri(),
                endpoint: format!("{}:{}{}", config.host, config.port, config.vhost),
                min_delay: config.reconnect_min_delay(),
                max_delay: config.reconnect_max_delay(),
                state_tx,
                current: RwLock::new(None),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl Inner {
    async fn supervise(self: Arc<Self>) {
        let mut backoff = ReconnectBackoff::new(self.min_delay, self.max_delay);
        let mut epoch = 0u64;

        loop {
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = Connection::connect_uri(self.uri.clone(), ConnectionProperties::default()) => result,
            };

            match attempt {
                Ok(connection) => {
                    let lost = Arc::new(Notify::new());
                    let notifier = Arc::clone(&lost);
                    connection.on_error(move |err| {
                        warn!(error = %err, "Broker connection failed");
                        notifier.notify_one();
                    });

                    epoch += 1;
                    *self.current.write().await = Some(connection);
                    backoff.reset();
                    debug!(endpoint = %self.endpoint, epoch, "Broker connection established");
                    self.state_tx.send_replace(ConnectionState::Connected(epoch));

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = lost.notified() => {}
                    }

                    self.current.write().await.take();
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                }
                Err(err) => {
                    warn!(
                        endpoint = %self.endpoint,
                        attempt = backoff.attempt() + 1,
                        error = %err,
                        "Failed to connect to broker"
                    );
                }
            }

            let delay = backoff.next_delay();
            debug!(endpoint = %self.endpoint, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state_tx.send_replace(ConnectionState::Closed);
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn open(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(endpoint = %self.inner.endpoint, "Connecting to broker");
        tokio::spawn(Arc::clone(&self.inner).supervise());
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let current = self.inner.current.read().await;
        let connection = current.as_ref().ok_or(BrokerError::NotConnected)?;
        let channel = connection.create_channel().await.map_err(map_error)?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.shutdown.cancel();
        let connection = self.inner.current.write().await.take();
        self.inner.state_tx.send_replace(ConnectionState::Closed);
        if let Some(connection) = connection {
            connection
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(map_error)?;
        }
        Ok(())
    }
}

/// lapin channel behind the broker seam.
struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn enable_confirms(&self) -> BrokerResult<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn set_prefetch(&self, count: u16, global: bool) -> BrokerResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> BrokerResult<()> {
        let mut properties = BasicProperties::default();
        if persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(map_error)?
            .await
            .map_err(map_error)?;

        match confirmation {
            Confirmation::Nack(_) => Err(BrokerError::Rejected(format!(
                "broker nacked message for {} with routing key {}",
                exchange, routing_key
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        let queue = queue.to_string();
        let stream = consumer.map(move |result| {
            result
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    queue: queue.clone(),
                    exchange: delivery.exchange.as_str().to_string(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    redelivered: delivery.redelivered,
                    body: delivery.data,
                })
                .map_err(map_error)
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(map_error)
    }
}

fn map_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(amqp.to_string()),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed(amqp.to_string())
            }
            _ => BrokerError::Rejected(amqp.to_string()),
        },
        lapin::Error::InvalidChannelState(state) => BrokerError::ChannelClosed(format!("{:?}", state)),
        lapin::Error::InvalidConnectionState(_) => BrokerError::NotConnected,
        other => BrokerError::Transport(other.to_string()),
    }
}
