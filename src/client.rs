//! Public entry point.
//!
//! A [`MessageQueue`] owns one broker connection and acts either as a
//! publisher or as a consumer, decided by the first `publish` or `listen`.
//!
//! ```no_run
//! use prometheus::Registry;
//! use shardmq::{Envelope, MessageQueue, Metrics, MqConfig};
//!
//! # async fn run() -> shardmq::Result<()> {
//! let metrics = Metrics::register(&Registry::new())?;
//! let mq = MessageQueue::new(MqConfig::new("localhost"), metrics)?;
//! mq.connect().await?;
//! mq.listen("orders", |envelope: Envelope| async move {
//!     println!("{:?}", envelope.body_str());
//!     envelope.acknowledge().await?;
//!     Ok::<_, anyhow::Error>(())
//! })
//! .await
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::{AmqpConnection, BrokerConnection, ConnectionState};
use crate::error::Result;
use crate::messaging::{
    ConnectionLifecycle, Consumer, InstanceMode, MessageHandler, Metrics, ModeGuard, Publisher,
    Role,
};
use crate::types::{MqConfig, Topic};

pub struct MessageQueue {
    config: MqConfig,
    lifecycle: ConnectionLifecycle,
    mode: ModeGuard,
    publisher: Publisher,
    consumer: Consumer,
    /// Token for the listen calls in progress; replaced after each cancel
    cancel: Mutex<CancellationToken>,
    metrics: Metrics,
}

impl MessageQueue {
    /// Create an instance talking to the AMQP broker in `config`.
    ///
    /// Fails with a configuration error, before any network activity, when
    /// the configuration is invalid.
    pub fn new(config: MqConfig, metrics: Metrics) -> Result<Self> {
        config.validate()?;
        let connection = Arc::new(AmqpConnection::new(&config));
        Self::with_connection(config, metrics, connection)
    }

    /// Create an instance over any broker connection.
    pub fn with_connection(
        config: MqConfig,
        metrics: Metrics,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            lifecycle: ConnectionLifecycle::new(Arc::clone(&connection), metrics.clone()),
            mode: ModeGuard::new(),
            publisher: Publisher::new(Arc::clone(&connection), &config, metrics.clone()),
            consumer: Consumer::new(connection, &config, metrics.clone()),
            cancel: Mutex::new(CancellationToken::new()),
            config,
            metrics,
        })
    }

    /// Connect to the broker.
    ///
    /// Resolves after the first successful connection; keeps waiting while
    /// the broker is unreachable.
    pub async fn connect(&self) -> Result<()> {
        self.lifecycle.connect().await
    }

    /// Publish `body` to the next shard queue of `topic`.
    ///
    /// Commits the instance to publisher mode. Broker failures are logged
    /// and counted and, under the default policy, not returned.
    pub async fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
        let topic = Topic::new(topic)?;
        self.mode.enter(Role::Publisher)?;
        self.lifecycle.start();
        self.publisher.publish(&topic, body).await
    }

    /// Consume all shard queues of `topic`, calling `handler` for each
    /// delivery, until [`cancel`](Self::cancel) or [`close`](Self::close).
    ///
    /// Commits the instance to consumer mode.
    pub async fn listen<H>(&self, topic: &str, handler: H) -> Result<()>
    where
        H: MessageHandler,
    {
        let topic = Topic::new(topic)?;
        let cancel = self.enter_consumer()?;
        self.lifecycle.start();
        self.consumer.listen(&topic, handler, cancel).await
    }

    /// Stop the listen calls in progress. No effect unless in consumer mode.
    pub fn cancel(&self) {
        let mut cancel = self.lock_cancel();
        if self.mode.current() != InstanceMode::Consumer {
            return;
        }
        cancel.cancel();
        *cancel = CancellationToken::new();
        info!("Consumption cancelled");
    }

    /// Stop consuming and close the broker connection.
    pub async fn close(&self) -> Result<()> {
        self.cancel_listeners();
        self.lifecycle.close().await
    }

    pub fn mode(&self) -> InstanceMode {
        self.mode.current()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn config(&self) -> &MqConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Commit to consumer mode and take the current cancellation token.
    ///
    /// Both happen under the token lock, so a concurrent [`cancel`](Self::cancel)
    /// either precedes the commit or reaches the returned token.
    fn enter_consumer(&self) -> Result<CancellationToken> {
        let cancel = self.lock_cancel();
        self.mode.enter(Role::Consumer)?;
        Ok(cancel.clone())
    }

    fn cancel_listeners(&self) {
        let mut cancel = self.lock_cancel();
        cancel.cancel();
        *cancel = CancellationToken::new();
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
