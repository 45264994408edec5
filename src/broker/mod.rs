//! Broker seam.
//!
//! The messaging layer talks to the broker only through [`BrokerConnection`]
//! and [`BrokerChannel`]. [`amqp::AmqpConnection`] implements them on top of
//! lapin; [`memory::MemoryBroker`] is an in-process broker with the same
//! semantics for tests and local runs.

pub mod amqp;
pub mod backoff;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

use crate::error::BrokerError;

pub use amqp::AmqpConnection;
pub use backoff::ReconnectBackoff;
pub use memory::MemoryBroker;

/// Result alias for broker seam calls.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Stream of deliveries from one consumer subscription.
///
/// The stream ends when the subscription is cancelled or the channel is lost.
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Observable state of the logical broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or first attempt in progress
    Connecting,
    /// Connected; the epoch increases on every successful (re)connect
    Connected(u64),
    /// Lost; the connection manager is retrying
    Disconnected,
    /// Closed on request; no further reconnects
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// Epoch of the live connection, if any.
    pub fn epoch(&self) -> Option<u64> {
        match self {
            ConnectionState::Connected(epoch) => Some(*epoch),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected(epoch) => write!(f, "connected (epoch {})", epoch),
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Exchange types used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Route by exact routing key
    Direct,
    /// Route to every bound queue
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag used to acknowledge or reject
    pub delivery_tag: u64,
    /// Queue the subscription reads from
    pub queue: String,
    /// Exchange the message was published to
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// A logical broker connection that survives reconnects.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Start connecting. Idempotent; reconnects are handled internally.
    fn open(&self);

    /// Subscribe to connection state transitions.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Open a channel on the live connection.
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Close the connection and stop reconnecting.
    async fn close(&self) -> BrokerResult<()>;
}

/// A logical session over the connection.
///
/// All declarations are durable: exchanges and queues survive a broker restart.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether the channel can still be used.
    ///
    /// A failed declaration or bind closes the channel, as in AMQP 0-9-1.
    fn is_open(&self) -> bool;

    /// Put the channel in publisher-confirm mode. Afterwards `publish`
    /// resolves only once the broker acknowledged the message.
    async fn enable_confirms(&self) -> BrokerResult<()>;

    /// Assert an exchange. Redeclaring with identical properties is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()>;

    /// Assert a queue. Redeclaring is a no-op.
    async fn declare_queue(&self, name: &str) -> BrokerResult<()>;

    /// Bind `queue` to `exchange` for `routing_key`.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Limit unacknowledged deliveries; `global` applies it to the whole channel.
    async fn set_prefetch(&self, count: u16, global: bool) -> BrokerResult<()>;

    /// Publish a message. `persistent` asks the broker to store it durably.
    ///
    /// In confirm mode a negative acknowledgement is returned as
    /// [`BrokerError::Rejected`]; otherwise the call only reports local failures.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> BrokerResult<()>;

    /// Start a subscription on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    /// Cancel the subscription registered under `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Negative acknowledgement; `requeue` puts the message back on its queue.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    /// Close the channel. Unacknowledged deliveries go back to their queues.
    async fn close(&self) -> BrokerResult<()>;
}
