//! Core types for the message-queue layer.

mod config;
mod topic;

pub use config::{HandlerErrorPolicy, MqConfig, PublishErrorPolicy};
pub use topic::{shard_queue_name, Topic};
