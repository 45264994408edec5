//! Topic names and the shard queues derived from them.

use std::fmt;

use crate::error::{MqError, Result};

/// A logical message stream; doubles as the name of its direct exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Validate a topic name. Empty names are rejected.
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(MqError::InvalidTopic(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    /// The exchange this topic publishes to.
    pub fn exchange(&self) -> &str {
        &self.0
    }

    /// Name of the shard queue at `index`; also its routing key.
    pub fn shard_queue(&self, index: usize) -> String {
        shard_queue_name(&self.0, index)
    }

    /// All shard queue names for `shard_count` shards, in index order.
    pub fn shard_queues(&self, shard_count: usize) -> Vec<String> {
        (0..shard_count).map(|index| self.shard_queue(index)).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `<topic>-<index>`
pub fn shard_queue_name(topic: &str, index: usize) -> String {
    format!("{}-{}", topic, index)
}
