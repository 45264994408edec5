//! Configuration types for the message-queue layer.

use std::time::Duration;

use config::{Config, Environment};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};

use crate::error::{MqError, Result};
use crate::{DEFAULT_PREFETCH, DEFAULT_SHARD_COUNT};

/// Prefix for all environment variables read by [`MqConfig::from_env`].
pub const ENV_PREFIX: &str = "RABBITMQ";

/// What the consumer does with a delivery whose handler returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Reject the delivery if the handler did not settle it
    #[default]
    Reject,
    /// Leave the delivery unsettled; the broker redelivers it when the channel closes
    Leave,
}

/// What the publisher does when the broker refuses a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishErrorPolicy {
    /// Log and count the failure, return success to the caller
    #[default]
    Swallow,
    /// Log and count the failure, then return it to the caller
    Propagate,
}

/// Broker connection and messaging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqConfig {
    /// Broker host name or address
    pub host: String,

    /// Broker AMQP port
    pub port: u16,

    /// Login user
    pub username: String,

    /// Login password
    #[serde(skip_serializing)]
    pub password: String,

    /// Virtual host
    pub vhost: String,

    /// Number of shard queues per topic
    pub shard_count: usize,

    /// Maximum unacknowledged deliveries per consumer channel
    pub prefetch: u16,

    /// Whether `reject()` asks the broker to requeue the message
    pub requeue_on_reject: bool,

    pub handler_error_policy: HandlerErrorPolicy,

    pub publish_error_policy: PublishErrorPolicy,

    /// First reconnect delay in milliseconds
    pub reconnect_min_delay_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds
    pub reconnect_max_delay_ms: u64,
}

/// Raw shape of the environment; everything is optional until validated.
#[derive(Debug, Default, Deserialize)]
struct EnvConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    vhost: Option<String>,
    shards: Option<usize>,
    prefetch: Option<u16>,
    requeue_on_reject: Option<bool>,
    handler_error_policy: Option<HandlerErrorPolicy>,
    publish_error_policy: Option<PublishErrorPolicy>,
    reconnect_min_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            shard_count: DEFAULT_SHARD_COUNT,
            prefetch: DEFAULT_PREFETCH,
            requeue_on_reject: true,
            handler_error_policy: HandlerErrorPolicy::default(),
            publish_error_policy: PublishErrorPolicy::default(),
            reconnect_min_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl MqConfig {
    /// Create a config for the given host with defaults for everything else.
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Default::default()
        }
    }

    /// Load configuration from `RABBITMQ_*` environment variables.
    ///
    /// Fails with [`MqError::Configuration`] when the host is missing.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(source: Environment) -> Result<Self> {
        let raw: EnvConfig = Config::builder()
            .add_source(source.try_parsing(true))
            .build()?
            .try_deserialize()?;

        let defaults = Self::default();
        let config = Self {
            host: raw.host.unwrap_or_default(),
            port: raw.port.unwrap_or(defaults.port),
            username: raw.username.unwrap_or(defaults.username),
            password: raw.password.unwrap_or(defaults.password),
            vhost: raw.vhost.unwrap_or(defaults.vhost),
            shard_count: raw.shards.unwrap_or(defaults.shard_count),
            prefetch: raw.prefetch.unwrap_or(defaults.prefetch),
            requeue_on_reject: raw.requeue_on_reject.unwrap_or(defaults.requeue_on_reject),
            handler_error_policy: raw
                .handler_error_policy
                .unwrap_or(defaults.handler_error_policy),
            publish_error_policy: raw
                .publish_error_policy
                .unwrap_or(defaults.publish_error_policy),
            reconnect_min_delay_ms: raw
                .reconnect_min_delay_ms
                .unwrap_or(defaults.reconnect_min_delay_ms),
            reconnect_max_delay_ms: raw
                .reconnect_max_delay_ms
                .unwrap_or(defaults.reconnect_max_delay_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Set the number of shard queues per topic.
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Set the consumer prefetch limit.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set whether rejected deliveries go back to their queue.
    pub fn with_requeue_on_reject(mut self, requeue: bool) -> Self {
        self.requeue_on_reject = requeue;
        self
    }

    /// Set the handler error policy.
    pub fn with_handler_error_policy(mut self, policy: HandlerErrorPolicy) -> Self {
        self.handler_error_policy = policy;
        self
    }

    /// Set the publish error policy.
    pub fn with_publish_error_policy(mut self, policy: PublishErrorPolicy) -> Self {
        self.publish_error_policy = policy;
        self
    }

    /// Check the required parameters.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(MqError::Configuration("broker host is required".to_string()));
        }
        if self.shard_count == 0 {
            return Err(MqError::Configuration(
                "shard count must be at least 1".to_string(),
            ));
        }
        if self.reconnect_min_delay_ms > self.reconnect_max_delay_ms {
            return Err(MqError::Configuration(format!(
                "reconnect delay range is empty: {}ms > {}ms",
                self.reconnect_min_delay_ms, self.reconnect_max_delay_ms
            )));
        }
        Ok(())
    }

    /// Connection target for this configuration.
    ///
    /// Built field by field, so credentials and vhost need no escaping. An
    /// IPv6 host may be given with or without brackets.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self
                    .host
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_string(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..Default::default()
        }
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}
