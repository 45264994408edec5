//! Error types for the message-queue layer.

use thiserror::Error;

use crate::messaging::mode::{InstanceMode, Role};

/// Errors returned by the broker seam.
///
/// These never escape a long-running publisher or consumer on their own; the
/// messaging layer logs and counts them and only surfaces them when a policy
/// asks for it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// No live connection to the broker
    #[error("not connected to broker")]
    NotConnected,

    /// The channel was closed by the broker or by a connection loss
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Exchange or queue does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Redeclaration with different properties
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The broker refused the operation
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// Anything reported by the underlying client library
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors returned by the public API.
#[derive(Error, Debug)]
pub enum MqError {
    /// Missing or invalid configuration; raised before any network activity
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Topic names must be non-empty
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),

    /// The instance already committed to the other role
    #[error("cannot act as {requested} while in {current} mode")]
    ModeConflict {
        current: InstanceMode,
        requested: Role,
    },

    /// Publish failure, surfaced only under `PublishErrorPolicy::Propagate`
    #[error("failed to publish to {exchange} with routing key {routing_key}: {source}")]
    Publish {
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    /// Broker interaction failed
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A delivery may be acknowledged or rejected only once
    #[error("delivery {delivery_tag} was already acknowledged or rejected")]
    AlreadySettled { delivery_tag: u64 },

    /// Metric registration failed
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<config::ConfigError> for MqError {
    fn from(err: config::ConfigError) -> Self {
        MqError::Configuration(err.to_string())
    }
}

/// Result alias for the public API.
pub type Result<T> = std::result::Result<T, MqError>;
