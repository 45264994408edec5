//! # Messaging
//!
//! Sharded publish/consume on top of the broker seam.
//!
//! ## Components
//! - Connection lifecycle: connects, tracks health in `mq_broker_up`
//! - Topology provisioner: direct exchange plus `topic-0 .. topic-(N-1)` queues
//! - Shard router: per-topic round-robin shard selection
//! - Publisher and consumer with prefetch-bounded delivery
//! - Mode guard: an instance either publishes or consumes, never both

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod metrics;
pub mod mode;
pub mod publisher;
pub mod shard_router;
pub mod topology;

pub use channel::{Acquired, ManagedChannel};
pub use connection::ConnectionLifecycle;
pub use consumer::{Consumer, MessageHandler};
pub use envelope::Envelope;
pub use metrics::Metrics;
pub use mode::{InstanceMode, ModeGuard, Role};
pub use publisher::Publisher;
pub use shard_router::ShardRouter;
pub use topology::{DeclarationChannel, ProvisionReport, TopologyProvisioner};
