//! Round-robin shard assignment per topic.
//!
//! Each topic cycles through `0..shard_count` independently. The cycle is
//! blind to queue depth and consumer lag.
//!
//! ## Time Complexity
//! - Next shard: O(1) expected (one hash map lookup under a short lock)

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Per-topic round-robin counter.
pub struct ShardRouter {
    shard_count: usize,
    /// Topic -> last index handed out
    last: Mutex<HashMap<String, usize>>,
}

impl ShardRouter {
    /// Create a router for `shard_count` shards (clamped to at least 1).
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Shard index for the next publish to `topic`.
    ///
    /// The first call for a topic returns 0; later calls advance by one and
    /// wrap from `shard_count - 1` back to 0.
    pub fn next_shard(&self, topic: &str) -> usize {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match last.get(topic) {
            None => 0,
            Some(&previous) if previous + 1 >= self.shard_count => 0,
            Some(&previous) => previous + 1,
        };
        last.insert(topic.to_string(), next);
        next
    }

    /// Last index handed out for `topic`, if any.
    pub fn last_shard(&self, topic: &str) -> Option<usize> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .copied()
    }
}
