//! ShardMQ Library
//!
//! A message-queue access layer for AMQP brokers. Publishes are spread
//! round-robin over a fixed number of shard queues per topic, and consumers
//! read all shard queues of a topic with a bounded number of unacknowledged
//! deliveries. Publish/consume counters and broker health are exported as
//! Prometheus metrics.

pub mod api;
pub mod broker;
pub mod client;
pub mod error;
pub mod messaging;
pub mod types;

pub use client::MessageQueue;
pub use error::{BrokerError, MqError, Result};
pub use messaging::{Envelope, InstanceMode, MessageHandler, Metrics};
pub use types::{HandlerErrorPolicy, MqConfig, PublishErrorPolicy, Topic};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::{BrokerConnection, ConnectionState, MemoryBroker};
    pub use crate::client::MessageQueue;
    pub use crate::error::*;
    pub use crate::messaging::{Envelope, InstanceMode, MessageHandler, Metrics};
    pub use crate::types::*;
}

/// Default number of shard queues per topic
pub const DEFAULT_SHARD_COUNT: usize = 2;

/// Default maximum of unacknowledged deliveries per consumer channel
pub const DEFAULT_PREFETCH: u16 = 10;
